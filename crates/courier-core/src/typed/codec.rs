//! PayloadCodec: typed payload <-> stored JSON value.

use super::task::Task;

pub struct PayloadCodec;

impl PayloadCodec {
    pub fn encode<T: Task>(task: &T) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(task)
    }

    pub fn decode<T: Task>(payload: &serde_json::Value) -> Result<T, serde_json::Error> {
        T::deserialize(payload)
    }
}
