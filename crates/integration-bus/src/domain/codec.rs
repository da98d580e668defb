//! # Payload Codec
//!
//! Publish side writes JSON with the exact field names serde produces.
//! Consume side matches struct field names ignoring ASCII case, so a
//! producer writing `{"Id": ..}` still decodes into a field named `id`.
//!
//! Case folding applies to every struct reached through plain fields,
//! `Option`, sequences and newtypes. A struct using `#[serde(flatten)]`
//! does not declare its fields to the deserializer, so its keys are folded
//! to lowercase instead: its own and its flattened fields must have
//! lowercase (snake_case) names. Enum payloads are matched exactly, and so
//! are the keys of maps and `serde_json::Value` targets.

use serde::de::value::StringDeserializer;
use serde::de::{
    self, DeserializeOwned, DeserializeSeed, Deserializer, Expected, IntoDeserializer, MapAccess,
    SeqAccess, Visitor,
};
use serde::forward_to_deserialize_any;
use serde::Serialize;
use serde_json::Value;

/// Serialize `value` to a UTF-8 JSON body using its declared field names.
///
/// # Errors
///
/// Propagates `serde_json` failures (e.g. non-string map keys).
pub fn to_payload<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(value)
}

/// Decode a JSON body, matching struct fields case-insensitively.
///
/// # Errors
///
/// Fails on malformed JSON or on a shape that does not fit `T`.
pub fn from_payload<T: DeserializeOwned>(payload: &[u8]) -> Result<T, serde_json::Error> {
    let value: Value = serde_json::from_slice(payload)?;
    T::deserialize(CaseInsensitive(value))
}

/// Pick the declared field matching `key`, preferring an exact match.
fn canonical_key(key: String, fields: &'static [&'static str]) -> String {
    if fields.contains(&key.as_str()) {
        return key;
    }
    fields
        .iter()
        .find(|field| field.eq_ignore_ascii_case(&key))
        .map_or(key, |field| (*field).to_string())
}

/// Fold keys of a struct whose field list is unknown (it flattens another).
///
/// A key that already has an exact lowercase twin in the object is kept as
/// is, so the exact match wins.
fn fold_keys(map: serde_json::Map<String, Value>) -> Vec<(String, Value)> {
    let entries: Vec<(String, Value)> = map.into_iter().collect();
    let exact: Vec<String> = entries
        .iter()
        .filter(|(key, _)| !key.bytes().any(|b| b.is_ascii_uppercase()))
        .map(|(key, _)| key.clone())
        .collect();
    entries
        .into_iter()
        .map(|(key, value)| {
            let lower = key.to_ascii_lowercase();
            if lower == key || exact.contains(&lower) {
                (key, value)
            } else {
                (lower, value)
            }
        })
        .collect()
}

/// Whether a `deserialize_map` call comes from a derived struct.
///
/// Derived struct visitors describe themselves as `struct Name`; maps and
/// dynamic values do not.
fn expects_struct<'de, V: Visitor<'de>>(visitor: &V) -> bool {
    (visitor as &dyn Expected).to_string().starts_with("struct ")
}

/// A JSON value whose struct fields are matched ignoring ASCII case.
struct CaseInsensitive(Value);

impl<'de> Deserializer<'de> for CaseInsensitive {
    type Error = serde_json::Error;

    fn deserialize_any<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        match self.0 {
            Value::Array(items) => visitor.visit_seq(Elements(items.into_iter())),
            Value::Object(map) => visitor.visit_map(Entries {
                iter: map.into_iter().collect::<Vec<_>>().into_iter(),
                value: None,
            }),
            other => other.deserialize_any(visitor),
        }
    }

    fn deserialize_option<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        match self.0 {
            Value::Null => visitor.visit_none(),
            _ => visitor.visit_some(self),
        }
    }

    fn deserialize_map<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        match self.0 {
            Value::Object(map) if expects_struct(&visitor) => visitor.visit_map(Entries {
                iter: fold_keys(map).into_iter(),
                value: None,
            }),
            other => CaseInsensitive(other).deserialize_any(visitor),
        }
    }

    fn deserialize_newtype_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> Result<V::Value, Self::Error> {
        visitor.visit_newtype_struct(self)
    }

    fn deserialize_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        fields: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, Self::Error> {
        match self.0 {
            Value::Object(map) => {
                let entries: Vec<(String, Value)> = map
                    .into_iter()
                    .map(|(key, value)| (canonical_key(key, fields), value))
                    .collect();
                visitor.visit_map(Entries {
                    iter: entries.into_iter(),
                    value: None,
                })
            }
            other => CaseInsensitive(other).deserialize_any(visitor),
        }
    }

    fn deserialize_enum<V: Visitor<'de>>(
        self,
        name: &'static str,
        variants: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, Self::Error> {
        self.0.deserialize_enum(name, variants, visitor)
    }

    forward_to_deserialize_any! {
        bool i8 i16 i32 i64 i128 u8 u16 u32 u64 u128 f32 f64 char str string
        bytes byte_buf unit unit_struct seq tuple tuple_struct identifier
        ignored_any
    }
}

struct Elements(std::vec::IntoIter<Value>);

impl<'de> SeqAccess<'de> for Elements {
    type Error = serde_json::Error;

    fn next_element_seed<T: DeserializeSeed<'de>>(
        &mut self,
        seed: T,
    ) -> Result<Option<T::Value>, Self::Error> {
        match self.0.next() {
            Some(value) => seed.deserialize(CaseInsensitive(value)).map(Some),
            None => Ok(None),
        }
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.0.len())
    }
}

struct Entries {
    iter: std::vec::IntoIter<(String, Value)>,
    value: Option<Value>,
}

impl<'de> MapAccess<'de> for Entries {
    type Error = serde_json::Error;

    fn next_key_seed<K: DeserializeSeed<'de>>(
        &mut self,
        seed: K,
    ) -> Result<Option<K::Value>, Self::Error> {
        match self.iter.next() {
            Some((key, value)) => {
                self.value = Some(value);
                let key: StringDeserializer<serde_json::Error> = key.into_deserializer();
                seed.deserialize(key).map(Some)
            }
            None => Ok(None),
        }
    }

    fn next_value_seed<V: DeserializeSeed<'de>>(&mut self, seed: V) -> Result<V::Value, Self::Error> {
        match self.value.take() {
            Some(value) => seed.deserialize(CaseInsensitive(value)),
            None => Err(de::Error::custom("map value requested before key")),
        }
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.iter.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Line {
        sku: String,
        quantity: u32,
    }

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Order {
        order_id: u64,
        customer: Option<String>,
        lines: Vec<Line>,
    }

    #[test]
    fn test_exact_casing_on_publish() {
        let order = Order {
            order_id: 1,
            customer: None,
            lines: vec![],
        };
        let body = String::from_utf8(to_payload(&order).unwrap()).unwrap();
        assert!(body.contains("\"order_id\":1"));
    }

    #[test]
    fn test_case_insensitive_top_level_and_nested() {
        let body = br#"{
            "ORDER_ID": 7,
            "Customer": "ada",
            "Lines": [{"SKU": "A-1", "Quantity": 2}]
        }"#;
        let order: Order = from_payload(body).unwrap();
        assert_eq!(
            order,
            Order {
                order_id: 7,
                customer: Some("ada".into()),
                lines: vec![Line {
                    sku: "A-1".into(),
                    quantity: 2
                }],
            }
        );
    }

    #[test]
    fn test_exact_match_wins_and_unknown_fields_ignored() {
        let body = br#"{"order_id": 3, "lines": [], "customer": null, "extra": true}"#;
        let order: Order = from_payload(body).unwrap();
        assert_eq!(order.order_id, 3);
        assert!(order.customer.is_none());
    }

    #[derive(Debug, Deserialize)]
    struct Shipment {
        #[serde(flatten)]
        meta: crate::domain::EventMetadata,
        order_id: u64,
        carrier: Option<String>,
        lines: Vec<Line>,
    }

    #[test]
    fn test_flattened_struct_matches_foreign_casing() {
        let body = br#"{
            "Id": "67e55044-10b1-426f-9247-bb680e5fe0c8",
            "Creation_Date": "2024-05-01T10:00:00Z",
            "Order_Id": 5,
            "CARRIER": "ups",
            "Lines": [{"Sku": "B-2", "QUANTITY": 1}]
        }"#;
        let shipment: Shipment = from_payload(body).unwrap();
        assert_eq!(shipment.order_id, 5);
        assert_eq!(shipment.carrier.as_deref(), Some("ups"));
        assert_eq!(shipment.lines[0].quantity, 1);
        assert_eq!(
            shipment.meta.id.to_string(),
            "67e55044-10b1-426f-9247-bb680e5fe0c8"
        );
    }

    #[test]
    fn test_flattened_struct_prefers_exact_key() {
        let body = br#"{
            "id": "67e55044-10b1-426f-9247-bb680e5fe0c8",
            "creation_date": "2024-05-01T10:00:00Z",
            "order_id": 8,
            "ORDER_ID": 9,
            "lines": []
        }"#;
        let shipment: Shipment = from_payload(body).unwrap();
        assert_eq!(shipment.order_id, 8);
    }

    #[test]
    fn test_map_keys_keep_their_casing() {
        #[derive(Deserialize)]
        struct Tagged {
            tags: std::collections::BTreeMap<String, String>,
        }
        let tagged: Tagged = from_payload(br#"{"Tags": {"Region": "EU"}}"#).unwrap();
        assert_eq!(tagged.tags.get("Region").map(String::as_str), Some("EU"));
    }

    #[test]
    fn test_shape_mismatch_is_error() {
        let body = br#"{"order_id": "not-a-number", "lines": []}"#;
        assert!(from_payload::<Order>(body).is_err());
        assert!(from_payload::<Order>(b"not json").is_err());
    }
}
