//! Parsers for `rbd` output.

/// Parse `rbd ls` output: one image name per line.
pub(crate) fn parse_image_list(payload: &str) -> Vec<String> {
    payload
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse `rbd snap ls` output into snapshot names, oldest first.
///
/// Rows carry an ascending snapshot id in the first column; the header line
/// drops out because `SNAPID` is not a number.
pub(crate) fn parse_snapshot_list(payload: &str) -> Vec<String> {
    let mut rows: Vec<(u64, String)> = payload
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let id = parts.next()?.parse::<u64>().ok()?;
            let name = parts.next()?;
            Some((id, name.to_string()))
        })
        .collect();
    rows.sort_by_key(|(id, _)| *id);
    rows.into_iter().map(|(_, name)| name).collect()
}
