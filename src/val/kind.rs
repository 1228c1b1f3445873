use crate::err::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The closed enumeration of noun kinds.
///
/// The kind tag routes a noun into its per-kind vector index partition and
/// is the coarsest filter of a search.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[non_exhaustive]
pub enum NounKind {
	Person,
	Organization,
	Location,
	Document,
	Event,
	Concept,
	Product,
	Service,
	Topic,
	Task,
	Project,
	Message,
	File,
	Image,
	Video,
	Audio,
	Dataset,
	Model,
	Tool,
	Process,
	System,
	Team,
	Role,
	Skill,
	Goal,
	Metric,
	Resource,
	Account,
	Device,
	Thing,
}

impl NounKind {
	/// Every noun kind, in declaration order.
	pub const ALL: [NounKind; 30] = [
		Self::Person,
		Self::Organization,
		Self::Location,
		Self::Document,
		Self::Event,
		Self::Concept,
		Self::Product,
		Self::Service,
		Self::Topic,
		Self::Task,
		Self::Project,
		Self::Message,
		Self::File,
		Self::Image,
		Self::Video,
		Self::Audio,
		Self::Dataset,
		Self::Model,
		Self::Tool,
		Self::Process,
		Self::System,
		Self::Team,
		Self::Role,
		Self::Skill,
		Self::Goal,
		Self::Metric,
		Self::Resource,
		Self::Account,
		Self::Device,
		Self::Thing,
	];

	pub fn as_str(&self) -> &'static str {
		match self {
			Self::Person => "person",
			Self::Organization => "organization",
			Self::Location => "location",
			Self::Document => "document",
			Self::Event => "event",
			Self::Concept => "concept",
			Self::Product => "product",
			Self::Service => "service",
			Self::Topic => "topic",
			Self::Task => "task",
			Self::Project => "project",
			Self::Message => "message",
			Self::File => "file",
			Self::Image => "image",
			Self::Video => "video",
			Self::Audio => "audio",
			Self::Dataset => "dataset",
			Self::Model => "model",
			Self::Tool => "tool",
			Self::Process => "process",
			Self::System => "system",
			Self::Team => "team",
			Self::Role => "role",
			Self::Skill => "skill",
			Self::Goal => "goal",
			Self::Metric => "metric",
			Self::Resource => "resource",
			Self::Account => "account",
			Self::Device => "device",
			Self::Thing => "thing",
		}
	}
}

impl Default for NounKind {
	fn default() -> Self {
		Self::Thing
	}
}

impl fmt::Display for NounKind {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for NounKind {
	type Err = Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Self::ALL.iter().find(|k| k.as_str() == s).copied().ok_or_else(|| Error::InvalidArgument {
			name: "kind",
			message: format!("'{s}' is not a noun kind"),
		})
	}
}

/// The closed enumeration of verb kinds.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[non_exhaustive]
pub enum VerbKind {
	RelatedTo,
	WorksWith,
	MemberOf,
	Mentors,
	Knows,
	Owns,
	Creates,
	Uses,
	PartOf,
	LocatedIn,
	ReportsTo,
	Manages,
	Supports,
	DependsOn,
	Produces,
	Consumes,
	References,
	Describes,
	Precedes,
	Follows,
	Causes,
	Influences,
	Contains,
	BelongsTo,
	CollaboratesWith,
	Teaches,
	Learns,
	Likes,
	Dislikes,
	Requires,
	Provides,
	Implements,
	Extends,
	Replaces,
	Supersedes,
	Validates,
	Observes,
	Triggers,
	ParticipatesIn,
	Attends,
}

impl VerbKind {
	/// Every verb kind, in declaration order.
	pub const ALL: [VerbKind; 40] = [
		Self::RelatedTo,
		Self::WorksWith,
		Self::MemberOf,
		Self::Mentors,
		Self::Knows,
		Self::Owns,
		Self::Creates,
		Self::Uses,
		Self::PartOf,
		Self::LocatedIn,
		Self::ReportsTo,
		Self::Manages,
		Self::Supports,
		Self::DependsOn,
		Self::Produces,
		Self::Consumes,
		Self::References,
		Self::Describes,
		Self::Precedes,
		Self::Follows,
		Self::Causes,
		Self::Influences,
		Self::Contains,
		Self::BelongsTo,
		Self::CollaboratesWith,
		Self::Teaches,
		Self::Learns,
		Self::Likes,
		Self::Dislikes,
		Self::Requires,
		Self::Provides,
		Self::Implements,
		Self::Extends,
		Self::Replaces,
		Self::Supersedes,
		Self::Validates,
		Self::Observes,
		Self::Triggers,
		Self::ParticipatesIn,
		Self::Attends,
	];

	pub fn as_str(&self) -> &'static str {
		match self {
			Self::RelatedTo => "related_to",
			Self::WorksWith => "works_with",
			Self::MemberOf => "member_of",
			Self::Mentors => "mentors",
			Self::Knows => "knows",
			Self::Owns => "owns",
			Self::Creates => "creates",
			Self::Uses => "uses",
			Self::PartOf => "part_of",
			Self::LocatedIn => "located_in",
			Self::ReportsTo => "reports_to",
			Self::Manages => "manages",
			Self::Supports => "supports",
			Self::DependsOn => "depends_on",
			Self::Produces => "produces",
			Self::Consumes => "consumes",
			Self::References => "references",
			Self::Describes => "describes",
			Self::Precedes => "precedes",
			Self::Follows => "follows",
			Self::Causes => "causes",
			Self::Influences => "influences",
			Self::Contains => "contains",
			Self::BelongsTo => "belongs_to",
			Self::CollaboratesWith => "collaborates_with",
			Self::Teaches => "teaches",
			Self::Learns => "learns",
			Self::Likes => "likes",
			Self::Dislikes => "dislikes",
			Self::Requires => "requires",
			Self::Provides => "provides",
			Self::Implements => "implements",
			Self::Extends => "extends",
			Self::Replaces => "replaces",
			Self::Supersedes => "supersedes",
			Self::Validates => "validates",
			Self::Observes => "observes",
			Self::Triggers => "triggers",
			Self::ParticipatesIn => "participates_in",
			Self::Attends => "attends",
		}
	}
}

impl Default for VerbKind {
	fn default() -> Self {
		Self::RelatedTo
	}
}

impl fmt::Display for VerbKind {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for VerbKind {
	type Err = Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Self::ALL.iter().find(|k| k.as_str() == s).copied().ok_or_else(|| Error::InvalidArgument {
			name: "kind",
			message: format!("'{s}' is not a verb kind"),
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn kinds_round_trip_through_strings() {
		for kind in NounKind::ALL {
			assert_eq!(kind.as_str().parse::<NounKind>().unwrap(), kind);
		}
		for kind in VerbKind::ALL {
			assert_eq!(kind.as_str().parse::<VerbKind>().unwrap(), kind);
		}
		assert!("sings".parse::<VerbKind>().is_err());
	}
}
