/// Failures surfaced by tree operations.
///
/// Duplicate inserts and removals of absent keys are reported through `bool`
/// returns, not errors. The only failure a caller can observe is the node
/// allocator running dry, and it is returned before the tree is modified.
#[allow(missing_docs)]
#[derive(Debug, Display, Error, Clone, Copy, PartialEq, Eq)]
#[display("{:?}", self)]
#[non_exhaustive]
pub enum Error {
    OutOfMemory,
}
