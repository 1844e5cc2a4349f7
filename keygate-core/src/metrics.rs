use std::fmt::Write;

use prometheus_client::encoding::{EncodeLabelValue, LabelValueEncoder};
use prometheus_client::registry::Registry;

use crate::strng::RichStrng;

pub fn sub_registry(registry: &mut Registry) -> &mut Registry {
	registry.sub_registry_with_prefix("keygate")
}

/// DefaultedUnknown encodes an optional label value, rendering missing values
/// as "unknown" rather than dropping the time series.
#[derive(Clone, Hash, Default, Debug, PartialEq, Eq)]
pub struct DefaultedUnknown<T>(Option<T>);

impl<T> From<Option<T>> for DefaultedUnknown<T> {
	fn from(t: Option<T>) -> Self {
		DefaultedUnknown(t)
	}
}

impl From<crate::strng::Strng> for DefaultedUnknown<RichStrng> {
	fn from(t: crate::strng::Strng) -> Self {
		DefaultedUnknown(Some(t.into()))
	}
}

impl<T: EncodeLabelValue> EncodeLabelValue for DefaultedUnknown<T> {
	fn encode(&self, writer: &mut LabelValueEncoder) -> Result<(), std::fmt::Error> {
		match self {
			DefaultedUnknown(Some(i)) => i.encode(writer),
			DefaultedUnknown(None) => writer.write_str("unknown"),
		}
	}
}

impl EncodeLabelValue for RichStrng {
	fn encode(&self, writer: &mut LabelValueEncoder) -> Result<(), std::fmt::Error> {
		use std::fmt::Write;
		writer.write_str(self.as_str())
	}
}
