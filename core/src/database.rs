/// Canonical spelling of every database the benchmark page measures.
pub const KNOWN_DATABASES: [&str; 5] = [
    "Deno KV",
    "Fauna",
    "DynamoDB",
    "PlanetScale",
    "Upstash Redis",
];

/// Maps a database name as found in the measurement log to its canonical
/// spelling.
///
/// Matching is case-insensitive and ignores surrounding whitespace, so the
/// historical `"Planetscale"` records land in the same bucket as
/// `"PlanetScale"`. Names outside [`KNOWN_DATABASES`] are returned trimmed but
/// otherwise untouched.
pub fn canonical_database_name(name: &str) -> String {
    let trimmed = name.trim();
    KNOWN_DATABASES
        .iter()
        .find(|known| known.eq_ignore_ascii_case(trimmed))
        .map(|known| (*known).to_string())
        .unwrap_or_else(|| trimmed.to_string())
}
