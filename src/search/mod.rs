pub mod executor;
pub mod highlight;
pub mod params;
pub mod scoring;

pub use executor::{execute, split_top_level, ReferenceTarget};
pub use params::{
    DropTokensMode, FacetStrategy, SearchParams, SplitJoinMode, TextMatchType, VectorQuery,
};
pub use scoring::{pack_score, proximity_score, TextMatchScore};
