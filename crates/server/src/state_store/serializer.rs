use std::{any::type_name, fmt::Debug};

use anyhow::Result;
use serde::de::DeserializeOwned;

pub struct JsonEncoder;

pub trait JsonEncode {
    fn encode<T: serde::Serialize + Debug>(value: &T) -> Result<Vec<u8>>;
    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T>;
}

impl JsonEncode for JsonEncoder {
    fn encode<T: serde::Serialize + Debug>(value: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| {
            anyhow::anyhow!(
                "error serializing into json: {}, type: {}, value: {:?}",
                e,
                type_name::<T>(),
                value
            )
        })
    }

    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        if bytes.is_empty() {
            return Err(anyhow::anyhow!(
                "empty bytes when decoding type: {}",
                type_name::<T>()
            ));
        }
        serde_json::from_slice(bytes).map_err(|e| {
            anyhow::anyhow!(
                "error deserializing from json bytes, {}, type: {}",
                e,
                type_name::<T>()
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_model::{MigrationRecord, MigrationStatus};

    #[test]
    fn test_decode_rejects_empty_bytes() {
        let err = JsonEncoder::decode::<MigrationRecord>(&[]).unwrap_err();
        assert!(err.to_string().contains("empty bytes"));
    }

    #[test]
    fn test_status_is_stored_by_name() -> Result<()> {
        let mut record = MigrationRecord::new("events_sample_by");
        record.status = MigrationStatus::Errored;
        let bytes = JsonEncoder::encode(&record)?;
        let json: serde_json::Value = serde_json::from_slice(&bytes)?;
        assert_eq!(json["status"], "Errored");
        assert_eq!(json["name"], "events_sample_by");
        Ok(())
    }
}
