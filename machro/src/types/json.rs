use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{
    Value,
    row::{Column, Decode, DecodeError},
};

/// Decode and bind json text columns.
///
/// Values are carried as strings on the wire, binding a `Json<T>` requires
/// [`Json::to_value`] since serialization may fail.
#[derive(Debug, Clone, PartialEq)]
pub struct Json<T>(pub T);

impl<T: Serialize> Json<T> {
    /// Serialize into a string [`Value`].
    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_string(&self.0).map(Value::from)
    }
}

impl From<Json<serde_json::Value>> for Value {
    fn from(value: Json<serde_json::Value>) -> Self {
        Value::from(value.0.to_string())
    }
}

impl<T> Decode for Json<T>
where
    T: DeserializeOwned,
{
    fn decode(column: Column) -> Result<Self, DecodeError> {
        let value = match column.value() {
            Value::String(s) => serde_json::from_str(s)?,
            Value::Binary(b) => serde_json::from_slice(b)?,
            Value::Null => return Err(DecodeError::Null),
            _ => return Err(column.mismatch("json")),
        };
        Ok(Self(value))
    }
}

impl<T: Serialize> Serialize for Json<T> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.0.serialize(serializer)
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Json<T> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        Ok(Self(T::deserialize(deserializer)?))
    }
}
