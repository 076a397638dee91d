//! Core domain model for Transferlens: player records, feature vectors,
//! checkpoint state and the CSV row codec shared across the pipeline.

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "tl-core";

/// Date format used on the stats site, e.g. "Jan 20, 2025".
pub const SITE_DATE_FORMAT: &str = "%b %d, %Y";

/// Canonical partition header. Column order is load-bearing: the consolidator
/// strips `name` by header position and the model consumes the rest.
pub const PARTITION_HEADER: &str =
    "transfer,name,age,market_value,position,joined_ts,expires_ts,appearances,goals,assists,team_rank";

/// Resume position of the crawl: next unit of work to attempt.
/// Wire field names match the stored progress object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointState {
    #[serde(rename = "team_idx")]
    pub team_index: usize,
    #[serde(rename = "player_idx")]
    pub player_index: usize,
}

impl CheckpointState {
    pub fn new(team_index: usize, player_index: usize) -> Self {
        Self {
            team_index,
            player_index,
        }
    }
}

/// The fixed position enumeration the model was trained on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Position {
    Goalkeeper,
    Defender,
    Midfield,
    Attack,
}

impl Position {
    pub fn code(self) -> i64 {
        match self {
            Position::Goalkeeper => 0,
            Position::Defender => 1,
            Position::Midfield => 2,
            Position::Attack => 3,
        }
    }

    /// Substring match against the site's position labels ("Goalkeeper",
    /// "Defensive Midfield", "Attack", ...).
    pub fn from_label(label: &str) -> Option<Self> {
        let lower = label.to_ascii_lowercase();
        [
            ("goalkeeper", Position::Goalkeeper),
            ("defender", Position::Defender),
            ("midfield", Position::Midfield),
            ("attack", Position::Attack),
        ]
        .into_iter()
        .find(|(needle, _)| lower.contains(needle))
        .map(|(_, position)| position)
    }
}

/// `-1` stands in for any label outside the fixed enumeration.
pub fn position_code(label: Option<&str>) -> i64 {
    label
        .and_then(Position::from_label)
        .map(Position::code)
        .unwrap_or(-1)
}

/// Absent, "-", or unparseable dates are all "no date".
pub fn parse_site_date(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "-" {
        return None;
    }
    NaiveDate::parse_from_str(trimmed, SITE_DATE_FORMAT).ok()
}

/// Unix timestamp at UTC midnight, 0 when the date is absent.
pub fn date_to_ts(raw: Option<&str>) -> i64 {
    raw.and_then(parse_site_date)
        .map(|date| date.and_time(NaiveTime::MIN).and_utc().timestamp())
        .unwrap_or(0)
}

/// Reduces the site's display string ("€25.00m", "-") to a bare number by
/// keeping digits and the decimal point, 0.0 when nothing parses.
pub fn parse_market_value(raw: Option<&str>) -> f64 {
    let Some(raw) = raw else {
        return 0.0;
    };
    let filtered: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    filtered.parse().unwrap_or(0.0)
}

/// "2023/24" → June 30 of the season's closing year.
pub fn season_end(reference_season: &str) -> Option<NaiveDate> {
    let (_, tail) = reference_season.split_once('/')?;
    let year: i32 = tail.trim().parse().ok()?;
    NaiveDate::from_ymd_opt(2000 + year, 6, 30)
}

/// 1 when the join date falls strictly after the reference season's end.
/// A missing join date cannot witness a move, so it labels 0.
pub fn transfer_label(joined: Option<NaiveDate>, reference_season: &str) -> u8 {
    match (joined, season_end(reference_season)) {
        (Some(joined), Some(end)) if joined > end => 1,
        _ => 0,
    }
}

/// Raw profile fields as scraped. Everything the site may omit is an Option;
/// defaulting happens exactly once, in `PlayerRecord::from_profile` or
/// `FeatureVector::from_profile`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlayerProfile {
    pub name: Option<String>,
    pub age: Option<u32>,
    pub position: Option<String>,
    pub market_value: Option<String>,
    pub joined: Option<String>,
    pub contract_expires: Option<String>,
    pub appearances: u32,
    pub goals: u32,
    pub assists: u32,
    pub rank: u32,
}

/// One partition row: a player's attributes plus the derived transfer label.
/// Constructed once per fetch, appended, never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerRecord {
    pub transfer: u8,
    pub name: String,
    pub age: u32,
    pub market_value: f64,
    pub position: i64,
    pub joined_ts: i64,
    pub expires_ts: i64,
    pub appearances: u32,
    pub goals: u32,
    pub assists: u32,
    pub team_rank: u32,
}

impl PlayerRecord {
    pub fn from_profile(profile: &PlayerProfile, team_rank: u32, reference_season: &str) -> Self {
        let joined = profile.joined.as_deref().and_then(parse_site_date);
        Self {
            transfer: transfer_label(joined, reference_season),
            name: profile.name.clone().unwrap_or_default(),
            age: profile.age.unwrap_or(0),
            market_value: parse_market_value(profile.market_value.as_deref()),
            position: position_code(profile.position.as_deref()),
            joined_ts: date_to_ts(profile.joined.as_deref()),
            expires_ts: date_to_ts(profile.contract_expires.as_deref()),
            appearances: profile.appearances,
            goals: profile.goals,
            assists: profile.assists,
            team_rank,
        }
    }

    /// One CSV row in `PARTITION_HEADER` column order.
    pub fn to_csv_row(&self) -> String {
        [
            self.transfer.to_string(),
            csv_escape(&self.name),
            self.age.to_string(),
            self.market_value.to_string(),
            self.position.to_string(),
            self.joined_ts.to_string(),
            self.expires_ts.to_string(),
            self.appearances.to_string(),
            self.goals.to_string(),
            self.assists.to_string(),
            self.team_rank.to_string(),
        ]
        .join(",")
    }
}

/// The 9-field input the scoring endpoint expects, in wire order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeatureVector {
    pub age: u32,
    pub market_value: f64,
    pub joined_ts: i64,
    pub expires_ts: i64,
    pub appearances: u32,
    pub goals: u32,
    pub assists: u32,
    pub rank: u32,
    pub position: i64,
}

impl FeatureVector {
    pub fn from_profile(profile: &PlayerProfile) -> Self {
        Self {
            age: profile.age.unwrap_or(0),
            market_value: parse_market_value(profile.market_value.as_deref()),
            joined_ts: date_to_ts(profile.joined.as_deref()),
            expires_ts: date_to_ts(profile.contract_expires.as_deref()),
            appearances: profile.appearances,
            goals: profile.goals,
            assists: profile.assists,
            rank: profile.rank,
            position: position_code(profile.position.as_deref()),
        }
    }

    /// CSV line encoding: age,market_value,joined_ts,expires_ts,appearances,
    /// goals,assists,rank,position.
    pub fn to_csv_line(&self) -> String {
        format!(
            "{},{},{},{},{},{},{},{},{}",
            self.age,
            self.market_value,
            self.joined_ts,
            self.expires_ts,
            self.appearances,
            self.goals,
            self.assists,
            self.rank,
            self.position
        )
    }
}

/// Quotes a CSV field only when it needs quoting.
pub fn csv_escape(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Splits one CSV line honoring double-quoted fields.
pub fn split_csv_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '"' if in_quotes => {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    current.push('"');
                } else {
                    in_quotes = false;
                }
            }
            '"' => in_quotes = true,
            ',' if !in_quotes => {
                fields.push(std::mem::take(&mut current));
            }
            _ => current.push(ch),
        }
    }
    fields.push(current);
    fields
}

/// Index of a named column in a CSV header line.
pub fn column_index(header_line: &str, column: &str) -> Option<usize> {
    split_csv_line(header_line)
        .iter()
        .position(|field| field.eq_ignore_ascii_case(column))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_codes_match_the_training_encoding() {
        assert_eq!(position_code(Some("Goalkeeper")), 0);
        assert_eq!(position_code(Some("Defender")), 1);
        assert_eq!(position_code(Some("Defensive Midfield")), 2);
        assert_eq!(position_code(Some("Attack")), 3);
    }

    #[test]
    fn unknown_position_maps_to_sentinel() {
        assert_eq!(position_code(Some("Libero")), -1);
        assert_eq!(position_code(None), -1);
    }

    #[test]
    fn dash_and_empty_dates_collapse_to_zero() {
        assert_eq!(date_to_ts(Some("-")), 0);
        assert_eq!(date_to_ts(Some("  ")), 0);
        assert_eq!(date_to_ts(None), 0);
        assert_eq!(date_to_ts(Some("not a date")), 0);
    }

    #[test]
    fn site_dates_parse_to_utc_midnight() {
        // Jan 1, 2020 00:00:00 UTC
        assert_eq!(date_to_ts(Some("Jan 1, 2020")), 1_577_836_800);
    }

    #[test]
    fn market_value_strips_currency_decoration() {
        assert_eq!(parse_market_value(Some("€25.00m")), 25.0);
        assert_eq!(parse_market_value(Some("$1.5m")), 1.5);
        assert_eq!(parse_market_value(Some("-")), 0.0);
        assert_eq!(parse_market_value(None), 0.0);
    }

    #[test]
    fn transfer_label_compares_against_season_end() {
        let before = NaiveDate::from_ymd_opt(2024, 6, 30).unwrap();
        let after = NaiveDate::from_ymd_opt(2024, 7, 1).unwrap();
        assert_eq!(transfer_label(Some(before), "2023/24"), 0);
        assert_eq!(transfer_label(Some(after), "2023/24"), 1);
        assert_eq!(transfer_label(None, "2023/24"), 0);
    }

    #[test]
    fn record_defaults_missing_fields_at_construction() {
        let profile = PlayerProfile {
            name: None,
            position: Some("Winger".to_string()),
            ..Default::default()
        };
        let record = PlayerRecord::from_profile(&profile, 7, "2023/24");
        assert_eq!(record.name, "");
        assert_eq!(record.age, 0);
        assert_eq!(record.market_value, 0.0);
        assert_eq!(record.position, -1);
        assert_eq!(record.joined_ts, 0);
        assert_eq!(record.team_rank, 7);
    }

    #[test]
    fn feature_vector_wire_order_is_stable() {
        let vector = FeatureVector {
            age: 24,
            market_value: 25.0,
            joined_ts: 1_600_000_000,
            expires_ts: 1_700_000_000,
            appearances: 30,
            goals: 12,
            assists: 5,
            rank: 3,
            position: 3,
        };
        assert_eq!(
            vector.to_csv_line(),
            "24,25,1600000000,1700000000,30,12,5,3,3"
        );
    }

    #[test]
    fn csv_codec_round_trips_quoted_names() {
        let escaped = csv_escape("Silva, Jr.");
        assert_eq!(escaped, "\"Silva, Jr.\"");
        let line = format!("1,{escaped},22");
        assert_eq!(split_csv_line(&line), vec!["1", "Silva, Jr.", "22"]);
    }

    #[test]
    fn header_column_lookup() {
        assert_eq!(column_index(PARTITION_HEADER, "name"), Some(1));
        assert_eq!(column_index(PARTITION_HEADER, "team_rank"), Some(10));
        assert_eq!(column_index(PARTITION_HEADER, "missing"), None);
    }
}
