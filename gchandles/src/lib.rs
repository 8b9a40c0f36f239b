mod age;
mod cache;
mod collector;
mod config;
mod dependent;
mod error;
mod handle;
mod kind;
mod map;
mod object;
mod refs;
mod scan;
mod segment;
mod stats;
mod table;

pub mod sim;

pub use age::{CLUMPS_PER_BLOCK, HANDLES_PER_BLOCK, HANDLES_PER_CLUMP};
pub use collector::{ExecutionEngine, GcHeap, PromoteFlags, PromoteFn, ScanContext};
pub use config::{MAX_GENERATION, MAX_HEAPS, MapCreateInfo, MapSettings};
pub use dependent::DhContext;
pub use error::HandleError;
pub use handle::Handle;
pub use kind::{HandleKind, KIND_COUNT, KindFlags, KindSet, VariableStrength};
pub use map::{HandleTableBucket, HandleTableMap};
pub use object::{Generation, ObjectRef};
pub use scan::{HandleVisitor, ScanFlags, ScanSlot};
pub use stats::{HandleStats, ScanSummary, StatsSnapshot};
pub use table::HandleTable;
