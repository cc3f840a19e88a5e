//! The mutable state guarded by `Db`'s single `RwLock` (§4.5): the log plus
//! every data structure's in-memory state, rebuilt once at `open` and kept in
//! sync with every committed transaction after that.

use crate::log_manager::LogManager;
use crate::op::Maps;

pub(crate) struct Core {
    pub log: LogManager,
    pub maps: Maps,
}
