//! Candidate extraction, validation, and ranking for recordfill.
//!
//! Raw page bodies, search snippets, and LLM answers come in; typed,
//! source-attributed [`Candidate`](recordfill_shared::Candidate)s go out.
//! The pieces are:
//! - [`html`]: HTML flattening and `tel:`/`mailto:`/`itemprop` harvesting
//! - [`Extractor`]: ordered pattern rules per field type
//! - [`Validator`]: per-field acceptance predicates
//! - [`rank`]: frequency ranking across sources
//! - [`split_address`]: street/number/complement split

mod address;
mod cleanup;
mod extractor;
pub mod html;
mod rank;
mod validate;

pub use address::{AddressParts, split_address};
pub use cleanup::{normalize_phone, normalize_postal_code, strip_boilerplate};
pub use extractor::{ExtractContext, Extractor};
pub use rank::{RankedCandidates, RankedValue, rank, rank_key};
pub use validate::{Rejection, Validator, check_org_id};
