use std::time::Duration;

use serde::Serializer;

/// YAML configs are transcoded through the JSON data model, so the two
/// formats deserialize through the same serde attributes and defaults.
pub mod yamlviajson {
	use serde::de::DeserializeOwned;

	pub fn from_str<T: DeserializeOwned>(s: &str) -> anyhow::Result<T> {
		let value: serde_json::Value = serde_yaml::from_str(s)?;
		Ok(serde_json::from_value(value)?)
	}
}

pub mod serde_dur {
	pub use duration_str::deserialize_duration as deserialize;
	use duration_str::HumanFormat;
	use serde::Serializer;

	pub fn serialize<S: Serializer, T: HumanFormat>(t: &T, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(&t.human_format())
	}
}

pub mod serde_dur_option {
	pub use duration_str::deserialize_option_duration as deserialize;
	use duration_str::HumanFormat;
	use serde::Serializer;

	pub fn serialize<S: Serializer, T: HumanFormat>(
		t: &Option<T>,
		serializer: S,
	) -> Result<S::Ok, S::Error> {
		match t {
			None => serializer.serialize_none(),
			Some(t) => serializer.serialize_str(&t.human_format()),
		}
	}
}

pub fn ser_redact<S: Serializer, T>(_t: &T, serializer: S) -> Result<S::Ok, S::Error> {
	serializer.serialize_str("<redacted>")
}

/// Durations in API responses are rendered as integer milliseconds.
pub fn ser_millis<S: Serializer>(t: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
	serializer.serialize_u64(t.as_millis() as u64)
}

pub fn ser_millis_option<S: Serializer>(
	t: &Option<Duration>,
	serializer: S,
) -> Result<S::Ok, S::Error> {
	match t {
		None => serializer.serialize_none(),
		Some(t) => ser_millis(t, serializer),
	}
}

