//! Progress notification throttling

/// Report every `interval`-th chunk, and always the last one
pub fn should_report(chunk_index: u64, is_last: bool, interval: u64) -> bool {
    is_last || chunk_index % interval.max(1) == 0
}

/// Percentage of the file relayed so far
///
/// Uses the byte count against the declared size; falls back to the chunk
/// count when the size is unknown. The last chunk is always 100.
pub fn percent(
    bytes_relayed: u64,
    file_size: u64,
    chunk_index: u64,
    total_chunks: Option<u64>,
    is_last: bool,
) -> f64 {
    if is_last {
        return 100.0;
    }
    let ratio = if file_size > 0 {
        bytes_relayed as f64 / file_size as f64
    } else {
        match total_chunks {
            Some(total) if total > 0 => (chunk_index + 1) as f64 / total as f64,
            _ => 0.0,
        }
    };
    (ratio * 100.0).clamp(0.0, 100.0)
}
