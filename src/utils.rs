pub const PAGE_SIZE_4K: u64 = 0x1000;
pub const PAGE_SIZE_64K: u64 = 0x1_0000;
pub const GB: u64 = 1 << 30;

/// Top of the shared virtual memory range (47-bit VA limit).
///
/// Passing this as the maximum address of a map call requests an unconstrained
/// placement instead of a previously reserved range.
pub const MAX_SVM_ADDRESS: u64 = (1 << 47) - 1;

#[must_use]
pub const fn align_up(val: u64, align: u64) -> u64 {
    (val + align - 1) & !(align - 1)
}

#[must_use]
pub const fn align_down(val: u64, align: u64) -> u64 {
    val & !(align - 1)
}

#[must_use]
pub const fn is_aligned(val: u64, align: u64) -> bool {
    val & (align - 1) == 0
}
