use std::borrow::Borrow;
use std::fmt::Display;
use std::ops::Deref;

/// Strng is a cheaply-clonable interned string. Model names, tier names and
/// key ids are passed around constantly; ArcStr makes those clones pointer
/// copies.
pub type Strng = arcstr::ArcStr;

pub use arcstr::literal;

pub fn new<A: AsRef<str>>(s: A) -> Strng {
	Strng::from(s.as_ref())
}

pub const EMPTY: Strng = literal!("");

/// RichStrng wraps Strng to allow implementing foreign traits (prometheus
/// label encoding, notably).
#[derive(Clone, Hash, Default, Debug, PartialEq, Eq)]
pub struct RichStrng(Strng);

impl RichStrng {
	pub fn as_str(&self) -> &str {
		self.0.as_ref()
	}
}

impl Deref for RichStrng {
	type Target = Strng;

	fn deref(&self) -> &Self::Target {
		&self.0
	}
}

impl<T: Into<Strng>> From<T> for RichStrng {
	fn from(value: T) -> Self {
		RichStrng(value.into())
	}
}

impl Display for RichStrng {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl Borrow<str> for RichStrng {
	fn borrow(&self) -> &str {
		self.0.borrow()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn interning_round_trips() {
		let s = new("claude-sonnet-4");
		assert_eq!(s.as_str(), "claude-sonnet-4");
		let r = RichStrng::from(s.clone());
		assert_eq!(r.as_str(), s.as_str());
	}
}
