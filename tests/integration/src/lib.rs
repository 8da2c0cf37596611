//! Marker crate; all behavior lives under `tests/` (the scenarios in
//! spec §8's end-to-end list, each wired across the real crates rather
//! than through a single crate's in-process fakes).
