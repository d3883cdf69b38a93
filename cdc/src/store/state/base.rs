use std::collections::BTreeSet;
use std::future::Future;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tokio_postgres::types::PgLsn;

use crate::error::CdcResult;

/// A persisted capture checkpoint of one replication slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Confirmed position, every event up to it was delivered.
    #[serde(with = "lsn_text")]
    pub position: PgLsn,
    /// Names of the streams captured when the checkpoint was taken.
    #[serde(default)]
    pub streams: BTreeSet<String>,
}

impl Checkpoint {
    pub fn new(position: PgLsn, streams: BTreeSet<String>) -> Self {
        Self { position, streams }
    }
}

/// Positions are stored in their `XXX/XXX` text form.
mod lsn_text {
    use super::*;
    use serde::de::Error;

    pub fn serialize<S: Serializer>(lsn: &PgLsn, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(lsn)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<PgLsn, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse()
            .map_err(|_| D::Error::custom(format!("invalid position '{text}'")))
    }
}

/// Trait for storing and retrieving capture checkpoints.
///
/// [`StateStore::store_checkpoint`] must only resolve successfully once the checkpoint is
/// durable, since the engine acknowledges the position to the server right afterwards and the
/// server may then discard the log before it.
pub trait StateStore {
    /// Returns the last checkpoint stored for `slot_name`, if any.
    fn load_checkpoint(
        &self,
        slot_name: &str,
    ) -> impl Future<Output = CdcResult<Option<Checkpoint>>> + Send;

    /// Durably stores `checkpoint` as the latest one of `slot_name`.
    fn store_checkpoint(
        &self,
        slot_name: &str,
        checkpoint: Checkpoint,
    ) -> impl Future<Output = CdcResult<()>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_position_is_stored_as_text() {
        let checkpoint = Checkpoint::new(
            PgLsn::from(0x16B3748),
            BTreeSet::from(["public-users".to_string()]),
        );

        let json = serde_json::to_string(&checkpoint).unwrap();
        assert_eq!(
            json,
            r#"{"position":"0/16B3748","streams":["public-users"]}"#
        );

        let parsed: Checkpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, checkpoint);
    }

    #[test]
    fn invalid_position_is_rejected() {
        let result = serde_json::from_str::<Checkpoint>(r#"{"position":"nope"}"#);
        assert!(result.is_err());
    }
}
