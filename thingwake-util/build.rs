//! Compile time configurations for the util crate
fn main() {
    // the THINGWAKE_PKG_NAME variable is used to create local folders under
    // `~/.config`, `~/.local/state` and other directories. Changing it orphans
    // the stored identity and the persisted wake state of every device.
    println!("cargo::rustc-env=THINGWAKE_PKG_NAME=thingwake");
}
