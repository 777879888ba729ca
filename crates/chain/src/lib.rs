pub mod abi;
pub mod errors;
pub mod intent;
pub mod log_event;
pub mod numeric;
pub mod packing;

pub use abi::EntryPoint;
pub use errors::{DecodedRevert, parse_error};
pub use intent::{DelegationAuthorization, Intent};
pub use log_event::{LogEvent, LogIngestBody, Severity};
pub use numeric::Numeric;
pub use packing::{PackedIntent, ValidationWindow, intent_hash, pack_intent, unpack_validation_data};
