pub(super) mod clear;
pub(super) mod copy;
pub(super) mod render;
pub(super) mod sync;
