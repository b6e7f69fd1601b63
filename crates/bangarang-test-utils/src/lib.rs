//! Empty library target; this crate exists only to host the end-to-end
//! tests under `tests/`, which wire the TCP provider and admin API up to
//! a live pipeline the way a real binary would.
