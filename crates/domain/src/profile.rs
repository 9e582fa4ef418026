//! User profile: biometrics and language pushed to the tracker.

use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

const HEIGHT_CM: (i64, i64) = (50, 250);
const WEIGHT_KG: (i64, i64) = (10, 300);
const BIRTH_YEAR: (i64, i64) = (1900, 2100);

/// Biological sex as understood by the tracker's calorie model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sex {
    Male,
    Female,
}

impl Sex {
    /// The device flag: `false` for male, `true` for female.
    #[must_use]
    pub fn flag(self) -> bool {
        matches!(self, Self::Female)
    }
}

impl FromStr for Sex {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "male" | "m" => Ok(Self::Male),
            "female" | "f" => Ok(Self::Female),
            _ => Err(ValidationError::UnknownValue {
                field: "sex",
                value: s.to_owned(),
            }),
        }
    }
}

/// Display language supported by the tracker firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Language {
    #[serde(rename = "en")]
    English,
    #[serde(rename = "es")]
    Spanish,
    #[serde(rename = "de")]
    German,
    #[serde(rename = "fr")]
    French,
    #[serde(rename = "it")]
    Italian,
    #[serde(rename = "ru")]
    Russian,
    #[serde(rename = "zh")]
    Chinese,
    #[serde(rename = "ja")]
    Japanese,
}

impl Language {
    /// ISO 639-1 code.
    #[must_use]
    pub fn code(self) -> &'static str {
        match self {
            Self::English => "en",
            Self::Spanish => "es",
            Self::German => "de",
            Self::French => "fr",
            Self::Italian => "it",
            Self::Russian => "ru",
            Self::Chinese => "zh",
            Self::Japanese => "ja",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Language {
    type Err = ValidationError;

    /// Accepts a bare code (`"en"`) or a locale (`"en_US"`, `"en-GB"`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let code = s
            .split(['_', '-'])
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();
        match code.as_str() {
            "en" => Ok(Self::English),
            "es" => Ok(Self::Spanish),
            "de" => Ok(Self::German),
            "fr" => Ok(Self::French),
            "it" => Ok(Self::Italian),
            "ru" => Ok(Self::Russian),
            "zh" => Ok(Self::Chinese),
            "ja" => Ok(Self::Japanese),
            _ => Err(ValidationError::UnsupportedLanguage(s.to_owned())),
        }
    }
}

/// The wearer, as needed by the tracker. Never persisted by this crate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub height_cm: u16,
    pub weight_kg: f32,
    pub date_of_birth: NaiveDate,
    pub sex: Sex,
    pub language: Language,
}

impl UserProfile {
    /// Create a builder for constructing a [`UserProfile`].
    #[must_use]
    pub fn builder() -> UserProfileBuilder {
        UserProfileBuilder::default()
    }

    /// Check domain invariants.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::OutOfRange`] when height, weight or birth
    /// year fall outside what the tracker can store.
    pub fn validate(&self) -> Result<(), ValidationError> {
        check_range("height_cm", i64::from(self.height_cm), HEIGHT_CM)?;
        #[allow(clippy::cast_possible_truncation)]
        check_range("weight_kg", self.weight_kg.round() as i64, WEIGHT_KG)?;
        check_range(
            "birth_year",
            i64::from(self.date_of_birth.year()),
            BIRTH_YEAR,
        )?;
        Ok(())
    }
}

fn check_range(field: &'static str, actual: i64, (min, max): (i64, i64)) -> Result<(), ValidationError> {
    if (min..=max).contains(&actual) {
        Ok(())
    } else {
        Err(ValidationError::OutOfRange {
            field,
            min,
            max,
            actual,
        })
    }
}

/// Step-by-step builder for [`UserProfile`].
#[derive(Debug, Default)]
pub struct UserProfileBuilder {
    height_cm: Option<u16>,
    weight_kg: Option<f32>,
    date_of_birth: Option<NaiveDate>,
    sex: Option<Sex>,
    language: Option<Language>,
}

impl UserProfileBuilder {
    #[must_use]
    pub fn height_cm(mut self, height_cm: u16) -> Self {
        self.height_cm = Some(height_cm);
        self
    }

    #[must_use]
    pub fn weight_kg(mut self, weight_kg: f32) -> Self {
        self.weight_kg = Some(weight_kg);
        self
    }

    #[must_use]
    pub fn date_of_birth(mut self, date_of_birth: NaiveDate) -> Self {
        self.date_of_birth = Some(date_of_birth);
        self
    }

    #[must_use]
    pub fn sex(mut self, sex: Sex) -> Self {
        self.sex = Some(sex);
        self
    }

    /// Defaults to English when not set.
    #[must_use]
    pub fn language(mut self, language: Language) -> Self {
        self.language = Some(language);
        self
    }

    /// Consume the builder, validate, and return a [`UserProfile`].
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::MissingField`] if a biometric field is
    /// missing, or [`ValidationError::OutOfRange`] for implausible values.
    pub fn build(self) -> Result<UserProfile, ValidationError> {
        let profile = UserProfile {
            height_cm: self
                .height_cm
                .ok_or(ValidationError::MissingField("height_cm"))?,
            weight_kg: self
                .weight_kg
                .ok_or(ValidationError::MissingField("weight_kg"))?,
            date_of_birth: self
                .date_of_birth
                .ok_or(ValidationError::MissingField("date_of_birth"))?,
            sex: self.sex.ok_or(ValidationError::MissingField("sex"))?,
            language: self.language.unwrap_or(Language::English),
        };
        profile.validate()?;
        Ok(profile)
    }
}
