/// Where a record lives on disk: which segment, at what byte offset, how long.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location {
    pub segment_id: u64,
    pub offset: u64,
    pub length: u32,
}
