//! Letter records and the untrusted-input boundary.
//!
//! `Letter` is the persisted shape (the local JSON file stores it
//! verbatim, password hash included). Nothing client-supplied becomes a
//! `Letter` except through [`LetterDraft::from_untrusted`], which trims
//! and requires the names, canonicalizes the delay, enforces the
//! password rule, and allowlists every cosmetic field.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::delay::{self, DelayInput, RevealStatus};

/// Minimum accepted edit-password length.
pub const MIN_PASSWORD_LEN: usize = 4;

/// Paper background for the letter view. Unknown values default rather
/// than error: cosmetic fields never reject a write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaperTheme {
    #[default]
    Classic,
    Warm,
    Mint,
    Lavender,
}

impl PaperTheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaperTheme::Classic => "classic",
            PaperTheme::Warm => "warm",
            PaperTheme::Mint => "mint",
            PaperTheme::Lavender => "lavender",
        }
    }

    pub fn parse_or_default(raw: Option<&str>) -> Self {
        match raw.map(str::trim) {
            Some("warm") => PaperTheme::Warm,
            Some("mint") => PaperTheme::Mint,
            Some("lavender") => PaperTheme::Lavender,
            _ => PaperTheme::Classic,
        }
    }
}

/// Seasonal decoration overlay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HolidayTheme {
    #[default]
    None,
    Christmas,
    Birthday,
    Newyear,
}

impl HolidayTheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            HolidayTheme::None => "none",
            HolidayTheme::Christmas => "christmas",
            HolidayTheme::Birthday => "birthday",
            HolidayTheme::Newyear => "newyear",
        }
    }

    pub fn parse_or_default(raw: Option<&str>) -> Self {
        match raw.map(str::trim) {
            Some("christmas") => HolidayTheme::Christmas,
            Some("birthday") => HolidayTheme::Birthday,
            Some("newyear") => HolidayTheme::Newyear,
            _ => HolidayTheme::None,
        }
    }
}

/// Decorative sticker tags, allowlist-filtered at intake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sticker {
    Star,
    Flower,
    Postmark,
}

impl Sticker {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sticker::Star => "star",
            Sticker::Flower => "flower",
            Sticker::Postmark => "postmark",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "star" => Some(Sticker::Star),
            "flower" => Some(Sticker::Flower),
            "postmark" => Some(Sticker::Postmark),
            _ => None,
        }
    }
}

/// Filter sticker tags to known values, dropping unknowns and collapsing
/// duplicates while preserving order.
pub fn stickers_from_tags<I>(tags: I) -> Vec<Sticker>
where
    I: IntoIterator<Item = String>,
{
    let mut out = Vec::new();
    for tag in tags {
        if let Some(sticker) = Sticker::parse(tag.trim()) {
            if !out.contains(&sticker) {
                out.push(sticker);
            }
        }
    }
    out
}

/// Parse the `stickers` form field: a JSON-encoded array of tag strings.
/// Anything unparseable is treated as no stickers.
pub fn parse_stickers(raw: Option<&str>) -> Vec<Sticker> {
    let Some(raw) = raw else {
        return Vec::new();
    };
    match serde_json::from_str::<Vec<String>>(raw) {
        Ok(tags) => stickers_from_tags(tags),
        Err(_) => Vec::new(),
    }
}

/// A persisted letter.
///
/// Everything past the original core fields is defaulted on
/// deserialization, so reads of records written by older revisions never
/// fail. The delay is stored as whichever shape the writing revision
/// used; [`Letter::canonical_delay_minutes`] re-derives the canonical
/// value on every read.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Letter {
    pub id: String,
    pub sender_name: String,
    pub recipient_name: String,
    #[serde(default)]
    pub recipient_email: Option<String>,
    #[serde(default)]
    pub sender_country: Option<String>,
    #[serde(default)]
    pub letter_content: String,
    #[serde(default)]
    pub delay_minutes: Option<i64>,
    /// Legacy companion to `delay_minutes`, kept so old readers of the
    /// letters file keep working. Consulted only when `delay_minutes`
    /// is absent.
    #[serde(default)]
    pub delay_days: Option<i64>,
    pub schedule_time: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub image_urls: Vec<String>,
    #[serde(default)]
    pub video_urls: Vec<String>,
    #[serde(default)]
    pub audio_url: Option<String>,
    #[serde(default)]
    pub stamp_data: Option<String>,
    #[serde(default)]
    pub paper_theme: PaperTheme,
    #[serde(default)]
    pub ambience_music: bool,
    #[serde(default)]
    pub stickers: Vec<Sticker>,
    #[serde(default)]
    pub holiday_theme: HolidayTheme,
    /// Stripped from every read projection; present here so the storage
    /// tier can persist it.
    #[serde(default)]
    pub edit_password_hash: Option<String>,
}

impl Letter {
    /// Canonical delay for this record, re-derived from whichever legacy
    /// shape is stored.
    pub fn canonical_delay_minutes(&self) -> i64 {
        delay::stored_delay_minutes(self.delay_minutes, self.delay_days)
    }

    pub fn reveal_status(&self, now: DateTime<Utc>) -> RevealStatus {
        delay::reveal_status(now, self.schedule_time, self.canonical_delay_minutes())
    }

    /// Read projection: password hash stripped, canonical delay
    /// materialized.
    pub fn to_public(&self) -> PublicLetter {
        let delay_minutes = self.canonical_delay_minutes();
        PublicLetter {
            id: self.id.clone(),
            sender_name: self.sender_name.clone(),
            recipient_name: self.recipient_name.clone(),
            recipient_email: self.recipient_email.clone(),
            sender_country: self.sender_country.clone(),
            letter_content: self.letter_content.clone(),
            delay_minutes,
            delay_days: delay_minutes / 1440,
            schedule_time: self.schedule_time,
            created_at: self.created_at,
            image_urls: self.image_urls.clone(),
            video_urls: self.video_urls.clone(),
            audio_url: self.audio_url.clone(),
            stamp_data: self.stamp_data.clone(),
            paper_theme: self.paper_theme,
            ambience_music: self.ambience_music,
            stickers: self.stickers.clone(),
            holiday_theme: self.holiday_theme,
        }
    }
}

/// A letter as the HTTP surface returns it: no password hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicLetter {
    pub id: String,
    pub sender_name: String,
    pub recipient_name: String,
    pub recipient_email: Option<String>,
    pub sender_country: Option<String>,
    pub letter_content: String,
    pub delay_minutes: i64,
    pub delay_days: i64,
    pub schedule_time: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub image_urls: Vec<String>,
    pub video_urls: Vec<String>,
    pub audio_url: Option<String>,
    pub stamp_data: Option<String>,
    pub paper_theme: PaperTheme,
    pub ambience_music: bool,
    pub stickers: Vec<Sticker>,
    pub holiday_theme: HolidayTheme,
}

/// Single-letter read response: the public letter plus its live reveal
/// projection.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LetterWithStatus {
    #[serde(flatten)]
    pub letter: PublicLetter,
    pub is_revealed: bool,
    /// Milliseconds until reveal; 0 once revealed.
    pub time_left: i64,
}

/// Raw create fields exactly as the client sent them. Nothing here is
/// trusted; [`LetterDraft::from_untrusted`] is the only way past this
/// type.
#[derive(Debug, Clone, Default)]
pub struct RawLetter {
    pub sender_name: Option<String>,
    pub recipient_name: Option<String>,
    pub recipient_email: Option<String>,
    pub letter_content: Option<String>,
    pub delay_minutes: Option<String>,
    pub delay_days: Option<String>,
    pub delay_hours: Option<String>,
    pub delay_minutes_part: Option<String>,
    pub edit_password: Option<String>,
    pub paper_theme: Option<String>,
    pub ambience_music: Option<String>,
    pub stickers: Option<String>,
    pub holiday_theme: Option<String>,
    pub stamp_data: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("senderName is required")]
    MissingSenderName,
    #[error("recipientName is required")]
    MissingRecipientName,
    #[error("an editPassword of at least {MIN_PASSWORD_LEN} characters is required when the delay is greater than zero")]
    PasswordRequired,
}

/// A validated letter, pre-persistence: names trimmed and non-empty,
/// delay canonical, password rule enforced, cosmetic fields allowlisted.
#[derive(Debug, Clone, PartialEq)]
pub struct LetterDraft {
    pub sender_name: String,
    pub recipient_name: String,
    pub recipient_email: Option<String>,
    pub letter_content: String,
    pub delay_minutes: i64,
    /// Plaintext; the service hashes it before anything is persisted.
    pub edit_password: Option<String>,
    pub paper_theme: PaperTheme,
    pub ambience_music: bool,
    pub stickers: Vec<Sticker>,
    pub holiday_theme: HolidayTheme,
    pub stamp_data: Option<String>,
}

fn non_empty_trimmed(raw: Option<String>) -> Option<String> {
    raw.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

impl LetterDraft {
    pub fn from_untrusted(raw: RawLetter) -> Result<Self, ValidationError> {
        let sender_name =
            non_empty_trimmed(raw.sender_name).ok_or(ValidationError::MissingSenderName)?;
        let recipient_name =
            non_empty_trimmed(raw.recipient_name).ok_or(ValidationError::MissingRecipientName)?;

        let delay_minutes = delay::normalize_delay(&DelayInput::from_form(
            raw.delay_minutes.as_deref(),
            raw.delay_days.as_deref(),
            raw.delay_hours.as_deref(),
            raw.delay_minutes_part.as_deref(),
        ));

        let edit_password = raw.edit_password.filter(|p| !p.is_empty());
        let edit_password = if delay_minutes > 0 {
            match edit_password {
                Some(p) if p.len() >= MIN_PASSWORD_LEN => Some(p),
                _ => return Err(ValidationError::PasswordRequired),
            }
        } else {
            // No pending window to protect; a password on an instant
            // letter is ignored.
            None
        };

        Ok(Self {
            sender_name,
            recipient_name,
            recipient_email: non_empty_trimmed(raw.recipient_email),
            letter_content: raw.letter_content.unwrap_or_default(),
            delay_minutes,
            edit_password,
            paper_theme: PaperTheme::parse_or_default(raw.paper_theme.as_deref()),
            ambience_music: raw.ambience_music.as_deref().map(str::trim) == Some("true"),
            stickers: parse_stickers(raw.stickers.as_deref()),
            holiday_theme: HolidayTheme::parse_or_default(raw.holiday_theme.as_deref()),
            stamp_data: raw.stamp_data.filter(|s| !s.is_empty()),
        })
    }
}
