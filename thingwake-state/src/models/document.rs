use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Keys and values of one side of a shadow
pub type StateMap = Map<String, Value>;

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
struct WireState {
    #[serde(default)]
    desired: Option<StateMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reported: Option<StateMap>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
struct WireDocument {
    state: WireState,
    #[serde(default)]
    version: u64,
    #[serde(default)]
    timestamp: i64,
}

/// A shadow document as fetched from the cloud
///
/// Wire shape:
/// `{ "state": { "desired": {...}, "reported": {...} }, "version": <int>, "timestamp": <int> }`
///
/// `version` belongs to the server. It is only ever echoed back in a report,
/// never bumped locally.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(try_from = "WireDocument", into = "WireDocument")]
pub struct ShadowDocument {
    pub desired: StateMap,
    pub reported: StateMap,
    version: u64,
    pub timestamp: i64,
}

impl ShadowDocument {
    pub fn new(desired: StateMap, reported: StateMap, version: u64, timestamp: i64) -> Self {
        Self {
            desired,
            reported,
            version,
            timestamp,
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }
}

#[derive(Debug, thiserror::Error)]
#[error("shadow document has no desired state")]
pub struct MissingDesiredError;

impl TryFrom<WireDocument> for ShadowDocument {
    type Error = MissingDesiredError;

    fn try_from(doc: WireDocument) -> Result<Self, Self::Error> {
        let WireDocument {
            state,
            version,
            timestamp,
        } = doc;
        Ok(Self {
            desired: state.desired.ok_or(MissingDesiredError)?,
            // on the first wake there is no reported side yet
            reported: state.reported.unwrap_or_default(),
            version,
            timestamp,
        })
    }
}

impl From<ShadowDocument> for WireDocument {
    fn from(doc: ShadowDocument) -> Self {
        WireDocument {
            state: WireState {
                desired: Some(doc.desired),
                reported: Some(doc.reported),
            },
            version: doc.version,
            timestamp: doc.timestamp,
        }
    }
}

#[derive(Serialize, Debug, Clone, PartialEq)]
struct ReportState {
    reported: StateMap,
}

/// The body of a shadow update: `{"state": {"reported": {...}}, "version": <int>}`
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ReportDocument {
    state: ReportState,
    version: u64,
}

impl ReportDocument {
    /// Build a report for the document it answers, echoing its version
    pub fn new(reported: StateMap, answering: &ShadowDocument) -> Self {
        Self {
            state: ReportState { reported },
            version: answering.version(),
        }
    }

    pub fn reported(&self) -> &StateMap {
        &self.state.reported
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn is_empty(&self) -> bool {
        self.state.reported.is_empty()
    }
}

/// What the server answered to a report
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Acknowledgement {
    #[serde(default)]
    pub version: Option<u64>,
    #[serde(default)]
    pub timestamp: Option<i64>,
}
