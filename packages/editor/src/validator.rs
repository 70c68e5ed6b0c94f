//! # Slug Validator
//!
//! Format rules are checked synchronously on every keystroke. When the
//! format is fine a debounce timer is armed; once the value has been quiet
//! for the configured delay the remote uniqueness lookup runs.
//!
//! Every call to [`SlugValidator::on_change`] bumps a generation counter and
//! publishes its immediate state under the lock that owns the timer task. A
//! timer or lookup only publishes its result while its generation is still
//! current, so a slow response for an older value can never overwrite the
//! state of a newer one.

use crate::errors::LookupError;
use crate::services::UniquenessCheck;
use regex::Regex;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use vows_common::OwnerIdentity;

pub const MIN_SLUG_LEN: usize = 3;
pub const MAX_SLUG_LEN: usize = 50;

/// Slugs that would shadow routes of the hosting site
pub const RESERVED_SLUGS: &[&str] = &[
    "admin", "api", "app", "assets", "dashboard", "help", "login", "logout", "preview",
    "settings", "signup", "static", "support", "www",
];

#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "code", rename_all = "camelCase")]
pub enum FormatError {
    #[error("must be at least {min} characters")]
    TooShort { min: usize },

    #[error("must be at most {max} characters")]
    TooLong { max: usize },

    #[error("only lowercase letters, numbers and hyphens are allowed")]
    InvalidCharacters,

    #[error("cannot start or end with a hyphen")]
    EdgeHyphen,

    #[error("cannot contain consecutive hyphens")]
    ConsecutiveHyphens,

    #[error("'{slug}' is reserved")]
    Reserved { slug: String },
}

fn slug_charset() -> &'static Regex {
    static CHARSET: OnceLock<Regex> = OnceLock::new();
    CHARSET.get_or_init(|| Regex::new(r"^[a-z0-9-]+$").expect("slug charset pattern"))
}

/// Synchronous format rules for a public slug
pub fn validate_format(value: &str) -> Result<(), FormatError> {
    let len = value.chars().count();
    if len < MIN_SLUG_LEN {
        return Err(FormatError::TooShort { min: MIN_SLUG_LEN });
    }
    if len > MAX_SLUG_LEN {
        return Err(FormatError::TooLong { max: MAX_SLUG_LEN });
    }
    if !slug_charset().is_match(value) {
        return Err(FormatError::InvalidCharacters);
    }
    if value.starts_with('-') || value.ends_with('-') {
        return Err(FormatError::EdgeHyphen);
    }
    if value.contains("--") {
        return Err(FormatError::ConsecutiveHyphens);
    }
    if RESERVED_SLUGS.contains(&value) {
        return Err(FormatError::Reserved {
            slug: value.to_string(),
        });
    }
    Ok(())
}

/// Observable validation state of the slug field
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum ValidationState {
    Idle,
    Invalid { error: FormatError },
    Checking { value: String },
    Available { value: String },
    Taken { value: String },
    /// The uniqueness lookup itself failed
    Unavailable { message: String },
}

impl ValidationState {
    pub fn is_settled(&self) -> bool {
        !matches!(self, ValidationState::Checking { .. })
    }
}

/// Generation counter and armed timer, always changed together
#[derive(Default)]
struct Debounce {
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

/// Debounced slug validator bound to one owner
pub struct SlugValidator {
    checker: Arc<dyn UniquenessCheck>,
    exclude: Option<OwnerIdentity>,
    delay: Duration,
    /// State is only published while this lock is held
    debounce: Arc<Mutex<Debounce>>,
    state: Arc<watch::Sender<ValidationState>>,
}

impl SlugValidator {
    pub fn new(
        checker: Arc<dyn UniquenessCheck>,
        exclude: Option<OwnerIdentity>,
        delay: Duration,
    ) -> Self {
        let (state, _) = watch::channel(ValidationState::Idle);
        Self {
            checker,
            exclude,
            delay,
            debounce: Arc::new(Mutex::new(Debounce::default())),
            state: Arc::new(state),
        }
    }

    /// Feed a new field value.
    ///
    /// Returns the state right after the synchronous format check. Must be
    /// called from within a tokio runtime when the format is valid.
    pub fn on_change(&self, value: &str) -> ValidationState {
        let immediate = if value.is_empty() {
            ValidationState::Idle
        } else {
            match validate_format(value) {
                Ok(()) => ValidationState::Checking {
                    value: value.to_string(),
                },
                Err(error) => ValidationState::Invalid { error },
            }
        };

        let mut debounce = lock(&self.debounce);
        debounce.generation += 1;
        if let Some(previous) = debounce.timer.take() {
            previous.abort();
        }
        self.state.send_replace(immediate.clone());

        if matches!(immediate, ValidationState::Checking { .. }) {
            debounce.timer = Some(tokio::spawn(debounced_lookup(
                self.checker.clone(),
                self.exclude.clone(),
                self.delay,
                value.to_string(),
                debounce.generation,
                self.debounce.clone(),
                self.state.clone(),
            )));
        }

        immediate
    }

    /// Uniqueness lookup without debounce or state tracking
    pub async fn check_uniqueness(&self, value: &str) -> Result<bool, LookupError> {
        self.checker.is_unique(value, self.exclude.as_ref()).await
    }

    pub fn state(&self) -> ValidationState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ValidationState> {
        self.state.subscribe()
    }

    /// Cancel any armed timer and return to `Idle`
    pub fn reset(&self) {
        let mut debounce = lock(&self.debounce);
        debounce.generation += 1;
        if let Some(previous) = debounce.timer.take() {
            previous.abort();
        }
        self.state.send_replace(ValidationState::Idle);
    }
}

impl Drop for SlugValidator {
    fn drop(&mut self) {
        if let Some(timer) = lock(&self.debounce).timer.take() {
            timer.abort();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn debounced_lookup(
    checker: Arc<dyn UniquenessCheck>,
    exclude: Option<OwnerIdentity>,
    delay: Duration,
    value: String,
    generation: u64,
    debounce: Arc<Mutex<Debounce>>,
    state: Arc<watch::Sender<ValidationState>>,
) {
    tokio::time::sleep(delay).await;
    if lock(&debounce).generation != generation {
        return;
    }

    debug!(slug = %value, "checking slug uniqueness");
    let result = checker.is_unique(&value, exclude.as_ref()).await;

    let next = match result {
        Ok(true) => ValidationState::Available { value },
        Ok(false) => ValidationState::Taken { value },
        Err(err) => {
            warn!(slug = %value, error = %err, "slug uniqueness lookup failed");
            ValidationState::Unavailable {
                message: err.to_string(),
            }
        }
    };

    let debounce = lock(&debounce);
    if debounce.generation == generation {
        state.send_replace(next);
    } else {
        debug!("discarding stale uniqueness result");
    }
}
