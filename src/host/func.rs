use crate::error::Trap;
use crate::model::Value;

/// Host function callable from guest code. The callback receives a borrowed
/// argument slice matching its declared parameters and returns result values
/// matching its declared results, or a trap that unwinds as if raised at the
/// call site.
pub type HostFunc = dyn Fn(&[Value]) -> Result<Vec<Value>, Trap> + Send + Sync;
