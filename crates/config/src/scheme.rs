//! Decoding of provider payloads embedded in extension resources.
//!
//! Payloads carry `apiVersion` and `kind`. A process-wide registry maps each
//! known group-version-kind to a function that decodes the serialized form
//! and converts it to the internal type.

use std::any::Any;
use std::collections::HashMap;
use std::sync::LazyLock;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::api;
use crate::v1alpha1;
use crate::{Error, Result, GROUP_NAME};

/// An internal type that has a registered serialized form.
pub trait Kind: Sized + Send + 'static {
    /// Value of the `kind` field.
    const KIND: &'static str;

    /// Serialized form in the preferred version.
    type Wire: Serialize + for<'a> From<&'a Self>;
}

macro_rules! register_kinds {
    ($($internal:ident => $wire:ident),* $(,)?) => {
        $(
            impl Kind for api::$internal {
                const KIND: &'static str = stringify!($internal);
                type Wire = v1alpha1::$wire;
            }
        )*

        static REGISTRY: LazyLock<HashMap<Gvk, DecodeFn>> = LazyLock::new(|| {
            let mut registry: HashMap<Gvk, DecodeFn> = HashMap::new();
            $(
                registry.insert(
                    Gvk::new(GROUP_NAME, v1alpha1::VERSION, stringify!($internal)),
                    decode_wire::<v1alpha1::$wire, api::$internal>,
                );
            )*
            registry
        });
    };
}

register_kinds! {
    InfrastructureConfig => InfrastructureConfig,
    InfrastructureStatus => InfrastructureStatus,
    InfrastructureState => InfrastructureState,
    CloudProfileConfig => CloudProfileConfig,
    ControlPlaneConfig => ControlPlaneConfig,
    WorkerConfig => WorkerConfig,
    WorkerStatus => WorkerStatus,
    BackupBucketConfig => BackupBucketConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Gvk {
    group: String,
    version: String,
    kind: String,
}

impl Gvk {
    fn new(group: &str, version: &str, kind: &str) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
        }
    }
}

type DecodeFn = fn(Value, Strictness) -> Result<Box<dyn Any + Send>>;

/// How unknown fields are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strictness {
    /// Unknown fields are an error. Used for user-provided spec payloads.
    Strict,
    /// Unknown fields are ignored. Used for status and state payloads.
    Lenient,
}

fn decode_wire<W, T>(value: Value, strictness: Strictness) -> Result<Box<dyn Any + Send>>
where
    W: DeserializeOwned,
    T: TryFrom<W> + Send + 'static,
    Error: From<<T as TryFrom<W>>::Error>,
{
    let wire: W = match strictness {
        Strictness::Lenient => serde_json::from_value(value)?,
        Strictness::Strict => {
            let mut unknown = Vec::new();
            let wire = serde_ignored::deserialize(value, |path| unknown.push(path.to_string()))?;
            if !unknown.is_empty() {
                return Err(Error::UnknownFields(unknown));
            }
            wire
        }
    };
    Ok(Box::new(T::try_from(wire)?))
}

/// Decoder over the registered kinds.
#[derive(Debug, Clone, Copy)]
pub struct Decoder {
    strictness: Strictness,
}

impl Decoder {
    /// Decoder rejecting unknown fields.
    #[must_use]
    pub const fn strict() -> Self {
        Self {
            strictness: Strictness::Strict,
        }
    }

    /// Decoder ignoring unknown fields.
    #[must_use]
    pub const fn lenient() -> Self {
        Self {
            strictness: Strictness::Lenient,
        }
    }

    /// Decodes a raw payload into `T`.
    ///
    /// # Errors
    ///
    /// Fails when the payload is empty or not JSON, lacks `apiVersion` or
    /// `kind`, names an unregistered kind or a kind other than `T`, or (in
    /// strict mode) contains unknown fields.
    pub fn decode<T: Kind>(&self, raw: &[u8]) -> Result<T> {
        if raw.iter().all(u8::is_ascii_whitespace) {
            return Err(Error::Empty);
        }
        let value: Value = serde_json::from_slice(raw)?;
        self.decode_value(value)
    }

    /// Decodes an already parsed payload into `T`.
    ///
    /// # Errors
    ///
    /// See [`Decoder::decode`].
    pub fn decode_value<T: Kind>(&self, mut value: Value) -> Result<T> {
        let object = value
            .as_object_mut()
            .ok_or(Error::MissingTypeMeta("apiVersion"))?;
        let api_version = take_string(object, "apiVersion")?;
        let kind = take_string(object, "kind")?;

        let (group, version) = api_version
            .split_once('/')
            .unwrap_or(("", api_version.as_str()));
        let gvk = Gvk::new(group, version, &kind);
        let decode = REGISTRY.get(&gvk).ok_or_else(|| Error::UnknownKind {
            api_version: api_version.clone(),
            kind: kind.clone(),
        })?;
        debug!(%api_version, %kind, strictness = ?self.strictness, "Decoding provider payload");

        let decoded = decode(value, self.strictness)?;
        decoded
            .downcast::<T>()
            .map(|boxed| *boxed)
            .map_err(|_| Error::KindMismatch {
                expected: T::KIND,
                actual: kind,
            })
    }

    /// Like [`Decoder::decode`], but an absent or empty payload yields the
    /// default object.
    ///
    /// # Errors
    ///
    /// See [`Decoder::decode`].
    pub fn decode_or_default<T: Kind + Default>(&self, raw: Option<&[u8]>) -> Result<T> {
        match raw {
            None => Ok(T::default()),
            Some(raw) if raw.iter().all(u8::is_ascii_whitespace) => Ok(T::default()),
            Some(raw) => self.decode(raw),
        }
    }
}

fn take_string(
    object: &mut serde_json::Map<String, Value>,
    field: &'static str,
) -> Result<String> {
    match object.remove(field) {
        Some(Value::String(value)) if !value.is_empty() => Ok(value),
        _ => Err(Error::MissingTypeMeta(field)),
    }
}

/// Serializes `object` in the preferred version, with type metadata.
///
/// # Errors
///
/// Fails only if the serialized form cannot be represented as JSON.
pub fn encode<T: Kind>(object: &T) -> Result<Value> {
    let mut value = serde_json::to_value(T::Wire::from(object))?;
    if let Value::Object(map) = &mut value {
        map.insert(
            "apiVersion".to_string(),
            Value::String(v1alpha1::API_VERSION.to_string()),
        );
        map.insert("kind".to_string(), Value::String(T::KIND.to_string()));
    }
    Ok(value)
}

#[derive(Deserialize)]
struct TypeMeta {
    #[serde(rename = "apiVersion")]
    api_version: Option<String>,
}

/// Returns `true` when an infrastructure state payload was written by the
/// flow-based reconciler. Unparsable or empty input yields `false`.
#[must_use]
pub fn has_flow_state(raw: Option<&[u8]>) -> bool {
    let Some(raw) = raw.filter(|raw| !raw.is_empty()) else {
        return false;
    };
    serde_json::from_slice::<TypeMeta>(raw)
        .ok()
        .and_then(|meta| meta.api_version)
        .is_some_and(|api_version| api_version == v1alpha1::API_VERSION)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn flow_state_is_recognized_by_api_version() {
        assert!(!has_flow_state(Some(
            br#"{"apiVersion":"foo.bar/v1alpha1","kind":"InfrastructureState"}"#
        )));
        assert!(has_flow_state(Some(
            br#"{"apiVersion":"azure.provider.extensions.gardener.cloud/v1alpha1","kind":"InfrastructureState"}"#
        )));
        assert!(!has_flow_state(Some(b"not json")));
        assert!(!has_flow_state(Some(b"")));
        assert!(!has_flow_state(None));
    }

    #[test]
    fn strict_decoding_rejects_unknown_fields() {
        let raw = br#"{
            "apiVersion": "azure.provider.extensions.gardener.cloud/v1alpha1",
            "kind": "InfrastructureConfig",
            "networks": {"workers": "10.250.0.0/16", "bogus": true}
        }"#;

        let err = Decoder::strict()
            .decode::<api::InfrastructureConfig>(raw)
            .unwrap_err();
        assert!(matches!(err, Error::UnknownFields(ref fields) if fields == &["networks.bogus"]));

        let config = Decoder::lenient()
            .decode::<api::InfrastructureConfig>(raw)
            .unwrap();
        assert_eq!(config.networks.workers.as_deref(), Some("10.250.0.0/16"));
    }

    #[test]
    fn missing_type_meta_is_an_error() {
        let err = Decoder::lenient()
            .decode::<api::WorkerStatus>(br#"{"kind":"WorkerStatus"}"#)
            .unwrap_err();
        assert!(matches!(err, Error::MissingTypeMeta("apiVersion")));

        let err = Decoder::lenient()
            .decode::<api::WorkerStatus>(
                br#"{"apiVersion":"azure.provider.extensions.gardener.cloud/v1alpha1"}"#,
            )
            .unwrap_err();
        assert!(matches!(err, Error::MissingTypeMeta("kind")));
    }

    #[test]
    fn registered_kind_with_other_target_is_rejected() {
        let raw = br#"{"apiVersion":"azure.provider.extensions.gardener.cloud/v1alpha1","kind":"WorkerStatus"}"#;
        let err = Decoder::lenient()
            .decode::<api::InfrastructureStatus>(raw)
            .unwrap_err();
        assert!(matches!(err, Error::KindMismatch { expected: "InfrastructureStatus", .. }));
    }

    #[test]
    fn unknown_group_is_rejected() {
        let raw = br#"{"apiVersion":"foo.bar/v1alpha1","kind":"WorkerStatus"}"#;
        let err = Decoder::lenient().decode::<api::WorkerStatus>(raw).unwrap_err();
        assert!(matches!(err, Error::UnknownKind { .. }));
    }

    #[test]
    fn empty_backup_bucket_config_is_default() {
        let decoder = Decoder::lenient();
        assert_eq!(
            decoder
                .decode_or_default::<api::BackupBucketConfig>(None)
                .unwrap(),
            api::BackupBucketConfig::default()
        );
        assert_eq!(
            decoder
                .decode_or_default::<api::BackupBucketConfig>(Some(b"  "))
                .unwrap(),
            api::BackupBucketConfig::default()
        );
        assert!(matches!(
            decoder.decode::<api::BackupBucketConfig>(b""),
            Err(Error::Empty)
        ));
    }

    #[test]
    fn state_survives_encode_and_decode() {
        let mut state = api::InfrastructureState::default();
        state.record("Microsoft.Network/virtualNetworks", "/subscriptions/s/vnet");

        let value = encode(&state).unwrap();
        assert_eq!(value["kind"], "InfrastructureState");
        assert_eq!(value["apiVersion"], v1alpha1::API_VERSION);

        let raw = serde_json::to_vec(&value).unwrap();
        assert!(has_flow_state(Some(&raw)));
        let decoded: api::InfrastructureState = Decoder::lenient().decode(&raw).unwrap();
        assert_eq!(decoded, state);
    }
}
