//! LinkPlay response payloads and the text decoding conventions they use.
//!
//! Every field of `getPlayerStatus` is a string, including numbers. Track
//! metadata is usually hex-encoded UTF-8 (`"48656C6C6F"` is `"Hello"`), but
//! some inputs send percent-encoded or plain text instead, so decoding is a
//! fallback chain: hex → percent → raw.

use serde::{Deserialize, Serialize};
use url::Url;

/// Volume reported when the device omits or garbles `vol`
pub const DEFAULT_VOLUME: u8 = 50;

/// Response of `getPlayerStatus`
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PlayerStatus {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub ch: Option<String>,
    pub mode: Option<String>,
    #[serde(rename = "loop")]
    pub loop_mode: Option<String>,
    pub eq: Option<String>,
    pub status: Option<String>,
    pub curpos: Option<String>,
    pub offset_pts: Option<String>,
    pub totlen: Option<String>,
    #[serde(rename = "Title")]
    pub title: Option<String>,
    #[serde(rename = "Artist")]
    pub artist: Option<String>,
    #[serde(rename = "Album")]
    pub album: Option<String>,
    #[serde(rename = "albumart_uri")]
    pub album_art_uri: Option<String>,
    pub alarmflag: Option<String>,
    pub plicount: Option<String>,
    pub plicurr: Option<String>,
    pub vol: Option<String>,
    pub mute: Option<String>,
    pub artwork: Option<String>,
    pub albumart: Option<String>,
}

impl PlayerStatus {
    pub fn is_playing(&self) -> bool {
        self.status.as_deref() == Some("play")
    }

    /// Volume in [0,100]. Out-of-range values clamp; garbage falls back to 50.
    pub fn volume_level(&self) -> u8 {
        self.vol
            .as_deref()
            .and_then(|v| v.trim().parse::<i64>().ok())
            .map(|v| v.clamp(0, 100) as u8)
            .unwrap_or(DEFAULT_VOLUME)
    }

    pub fn is_muted(&self) -> bool {
        self.mute.as_deref() == Some("1")
    }

    /// Current position in whole seconds (`curpos` is milliseconds)
    pub fn position_secs(&self) -> u32 {
        millis_to_secs(self.curpos.as_deref())
    }

    /// Track length in whole seconds (`totlen` is milliseconds)
    pub fn duration_secs(&self) -> u32 {
        millis_to_secs(self.totlen.as_deref())
    }

    pub fn decoded_title(&self) -> String {
        self.title.as_deref().map(decode_text).unwrap_or_default()
    }

    pub fn decoded_artist(&self) -> String {
        self.artist.as_deref().map(decode_text).unwrap_or_default()
    }

    pub fn decoded_album(&self) -> String {
        self.album.as_deref().map(decode_text).unwrap_or_default()
    }

    /// First usable album art reference, in field priority order:
    /// `albumart_uri`, `artwork`, `albumart`.
    pub fn album_art_url(&self) -> Option<Url> {
        [&self.album_art_uri, &self.artwork, &self.albumart]
            .into_iter()
            .flatten()
            .filter(|uri| !uri.is_empty())
            .find_map(|uri| Url::parse(&decode_text(uri)).ok())
    }
}

fn millis_to_secs(value: Option<&str>) -> u32 {
    value
        .and_then(|v| v.trim().parse::<i64>().ok())
        .map(|ms| (ms.max(0) / 1000).min(u32::MAX as i64) as u32)
        .unwrap_or(0)
}

/// Decode a device text field: hex UTF-8 first, then percent-decoding,
/// then the string as given.
pub fn decode_text(raw: &str) -> String {
    if let Some(text) = decode_hex_text(raw) {
        return text;
    }
    match urlencoding::decode(raw) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => raw.to_string(),
    }
}

/// Interpret `raw` as hex-encoded UTF-8.
///
/// Returns `None` unless the string is non-empty, has even length, contains
/// only `0-9A-Fa-f`, and the bytes form valid UTF-8.
pub fn decode_hex_text(raw: &str) -> Option<String> {
    if !is_hex_text(raw) {
        return None;
    }
    let bytes = hex::decode(raw).ok()?;
    String::from_utf8(bytes).ok()
}

pub fn is_hex_text(raw: &str) -> bool {
    !raw.is_empty() && raw.len() % 2 == 0 && raw.bytes().all(|b| b.is_ascii_hexdigit())
}

// =============================================================================
// Presets
// =============================================================================

/// Response of `getPresetInfo`
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PresetResponse {
    #[serde(rename = "preset_num")]
    pub preset_num: Option<i64>,
    #[serde(rename = "preset_list")]
    pub preset_list: Option<Vec<Preset>>,
}

/// A device-stored quick-play shortcut
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Preset {
    pub number: u32,
    pub name: Option<String>,
    pub url: Option<String>,
    pub source: Option<String>,
    pub picurl: Option<String>,
}

impl Preset {
    pub fn display_name(&self) -> String {
        match &self.name {
            Some(name) if !name.is_empty() => name.clone(),
            _ => format!("Preset {}", self.number),
        }
    }

    pub fn artwork_url(&self) -> Option<Url> {
        self.picurl
            .as_deref()
            .filter(|u| !u.is_empty())
            .and_then(|u| Url::parse(u).ok())
    }

    /// Loose match between a now-playing title and this preset's name.
    /// Station streams rarely echo the preset name exactly, so either string
    /// containing the other counts.
    pub fn matches_title(&self, title: &str) -> bool {
        let Some(name) = self.name.as_deref().filter(|n| !n.is_empty()) else {
            return false;
        };
        let name = name.to_lowercase();
        let title = title.to_lowercase();
        title.contains(&name) || name.contains(&title)
    }
}

/// Parse an `EQGetList` body: a JSON array of names, or failing that a
/// comma-separated list.
pub fn parse_eq_list(body: &[u8]) -> Vec<String> {
    if let Ok(presets) = serde_json::from_slice::<Vec<String>>(body) {
        return presets;
    }
    String::from_utf8_lossy(body)
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    fn status_json(json: &str) -> PlayerStatus {
        serde_json::from_str(json).expect("valid status json")
    }

    #[test]
    fn hex_title_decodes() {
        let status = status_json(r#"{"Title":"48656C6C6F"}"#);
        assert_eq!(status.decoded_title(), "Hello");
    }

    #[test]
    fn hex_round_trips_utf8() {
        for text in ["Sigur Rós", "東京事変", "Beyoncé – Halo", "a"] {
            let encoded = hex::encode_upper(text);
            assert_eq!(decode_text(&encoded), text);
            assert_eq!(decode_text(&encoded.to_lowercase()), text);
        }
    }

    #[test]
    fn non_hex_falls_through_to_percent_decoding() {
        assert_eq!(decode_text("Hello%20World"), "Hello World");
        assert_eq!(decode_text("Plain Title"), "Plain Title");
        // Odd length hex-looking input is not hex
        assert_eq!(decode_text("ABC"), "ABC");
    }

    #[test]
    fn hex_that_is_not_utf8_falls_through() {
        // "1984" is valid hex but 0x19 0x84 is not valid UTF-8
        assert_eq!(decode_text("1984"), "1984");
    }

    #[test]
    fn invalid_percent_sequences_keep_raw() {
        assert_eq!(decode_text("100%"), "100%");
    }

    #[test]
    fn volume_defaults_and_clamps() {
        assert_eq!(status_json(r#"{}"#).volume_level(), 50);
        assert_eq!(status_json(r#"{"vol":"abc"}"#).volume_level(), 50);
        assert_eq!(status_json(r#"{"vol":"150"}"#).volume_level(), 100);
        assert_eq!(status_json(r#"{"vol":"-5"}"#).volume_level(), 0);
        assert_eq!(status_json(r#"{"vol":"37"}"#).volume_level(), 37);
    }

    #[test]
    fn positions_are_floor_divided_milliseconds() {
        let status = status_json(r#"{"curpos":"61999","totlen":"240500"}"#);
        assert_eq!(status.position_secs(), 61);
        assert_eq!(status.duration_secs(), 240);

        let status = status_json(r#"{"curpos":"-20","totlen":"n/a"}"#);
        assert_eq!(status.position_secs(), 0);
        assert_eq!(status.duration_secs(), 0);
    }

    #[test]
    fn playing_and_mute_flags() {
        let status = status_json(r#"{"status":"play","mute":"1"}"#);
        assert!(status.is_playing());
        assert!(status.is_muted());

        let status = status_json(r#"{"status":"pause","mute":"0"}"#);
        assert!(!status.is_playing());
        assert!(!status.is_muted());
    }

    #[test]
    fn album_art_priority_order() {
        let status = status_json(
            r#"{"albumart_uri":"","artwork":"https://b.example/art.jpg","albumart":"https://c.example/art.jpg"}"#,
        );
        assert_eq!(
            status.album_art_url().unwrap().as_str(),
            "https://b.example/art.jpg"
        );
    }

    #[test]
    fn album_art_skips_unparsable_and_decodes_hex() {
        let hex_url = hex::encode("https://img.example/cover.png");
        let status = status_json(&format!(
            r#"{{"albumart_uri":"un_known","artwork":"{}"}}"#,
            hex_url
        ));
        assert_eq!(
            status.album_art_url().unwrap().as_str(),
            "https://img.example/cover.png"
        );

        assert!(status_json(r#"{"albumart":"un_known"}"#).album_art_url().is_none());
    }

    #[test]
    fn full_status_payload() {
        let status = status_json(
            r#"{"type":"0","ch":"0","mode":"10","loop":"0","eq":"0","status":"play",
                "curpos":"12000","offset_pts":"0","totlen":"180000",
                "Title":"536F6E67","Artist":"417274697374","Album":"416C62756D",
                "alarmflag":"0","plicount":"1","plicurr":"1","vol":"22","mute":"0"}"#,
        );
        assert_eq!(status.decoded_title(), "Song");
        assert_eq!(status.decoded_artist(), "Artist");
        assert_eq!(status.decoded_album(), "Album");
        assert_eq!(status.volume_level(), 22);
        assert_eq!(status.mode.as_deref(), Some("10"));
    }

    #[test]
    fn preset_display_name_and_matching() {
        let preset = Preset {
            number: 2,
            name: Some("Radio Paradise".to_string()),
            url: None,
            source: Some("TuneIn".to_string()),
            picurl: Some("https://img.example/rp.png".to_string()),
        };
        assert_eq!(preset.display_name(), "Radio Paradise");
        assert!(preset.matches_title("Radio Paradise - Main Mix"));
        assert!(preset.matches_title("radio paradise"));
        assert!(!preset.matches_title("Something else"));
        assert!(preset.artwork_url().is_some());

        let unnamed = Preset {
            number: 4,
            name: None,
            url: None,
            source: None,
            picurl: Some(String::new()),
        };
        assert_eq!(unnamed.display_name(), "Preset 4");
        assert!(!unnamed.matches_title("anything"));
        assert!(unnamed.artwork_url().is_none());
    }

    #[test]
    fn preset_response_parses() {
        let response: PresetResponse = serde_json::from_str(
            r#"{"preset_num":2,"preset_list":[
                {"number":1,"name":"Jazz","url":"x","source":"TuneIn","picurl":""},
                {"number":2,"name":"News"}]}"#,
        )
        .unwrap();
        let list = response.preset_list.unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[1].number, 2);
        assert!(list[1].picurl.is_none());
    }

    #[test]
    fn eq_list_json_and_csv() {
        assert_eq!(
            parse_eq_list(br#"["Flat","Acoustic","Bass Booster"]"#),
            vec!["Flat", "Acoustic", "Bass Booster"]
        );
        assert_eq!(parse_eq_list(b"Flat, Rock ,,Jazz"), vec!["Flat", "Rock", "Jazz"]);
        assert!(parse_eq_list(b"").is_empty());
    }
}
