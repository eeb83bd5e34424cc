/*
This crate is home to everything that talks to the cloud side of a thing.

It signs requests with the thing's credentials, keeps a trusted wall clock
for those signatures, and moves shadow documents in and out over HTTP
while coping with a peer that keeps the connection open after a response.
*/

mod clock;
mod config;
mod signer;
mod transport;

pub use clock::{ClockUnsyncedError, SntpClient, SystemClock, TimeSource, TimeSyncError};
pub use config::{RemoteConfig, RequestConfig, ThingIdentity};
pub use signer::{
    CanonicalRequest, Credentials, RequestSigner, SecretKey, Signature, SignedRequest,
};
pub use transport::{ShadowTransport, TransportError};

use thingwake_state as state;
use thingwake_util as util;
