//! JSON-file persistence for settings, profiles and subscriptions.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine as _;
use tracing::{debug, info};

use crate::config;
use crate::error::{AppError, Result};
use crate::link::{self, ConnectionDescriptor};
use crate::settings::{Profile, Settings, Subscription};

const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// What the supervisor needs from persistence.
pub trait Store: Send + Sync {
    /// Settings with defaults applied; a missing file yields defaults.
    fn load_settings(&self) -> Result<Settings>;
    fn save_settings(&self, settings: &Settings) -> Result<()>;
    fn load_profiles(&self) -> Result<Vec<Profile>>;
}

pub struct JsonStore {
    dir: PathBuf,
}

impl JsonStore {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn save_profiles(&self, profiles: &[Profile]) -> Result<()> {
        config::save_json(&config::profiles_path(&self.dir), &profiles)
    }

    /// Add a profile from a `vless://` link, named after its fragment or host.
    pub fn add_profile(&self, link: &str) -> Result<Profile> {
        let link = link.trim();
        let descriptor = ConnectionDescriptor::parse(link)?;
        let profile = Profile {
            id: uuid::Uuid::new_v4().to_string(),
            name: descriptor.display_name().to_string(),
            key: link.to_string(),
            subscription_id: None,
            created_at: unix_now(),
        };

        let mut profiles = self.load_profiles()?;
        profiles.push(profile.clone());
        self.save_profiles(&profiles)?;
        info!(id = %profile.id, name = %profile.name, "profile_added");
        Ok(profile)
    }

    pub fn update_profile(&self, id: &str, name: &str, link: &str) -> Result<Profile> {
        let link = link.trim();
        ConnectionDescriptor::parse(link)?;

        let mut profiles = self.load_profiles()?;
        let profile = profiles
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or_else(|| AppError::ProfileNotFound(id.to_string()))?;
        profile.name = name.to_string();
        profile.key = link.to_string();
        let updated = profile.clone();

        self.save_profiles(&profiles)?;
        info!(id = %id, "profile_updated");
        Ok(updated)
    }

    pub fn delete_profile(&self, id: &str) -> Result<()> {
        let mut profiles = self.load_profiles()?;
        let before = profiles.len();
        profiles.retain(|p| p.id != id);
        if profiles.len() == before {
            return Err(AppError::ProfileNotFound(id.to_string()));
        }
        self.save_profiles(&profiles)?;
        info!(id = %id, "profile_deleted");
        Ok(())
    }

    pub fn load_subscriptions(&self) -> Result<Vec<Subscription>> {
        Ok(config::load_json(&config::subscriptions_path(&self.dir))?.unwrap_or_default())
    }

    fn save_subscriptions(&self, subs: &[Subscription]) -> Result<()> {
        config::save_json(&config::subscriptions_path(&self.dir), &subs)
    }

    /// Register a subscription URL and fetch it once.
    ///
    /// The subscription is kept even if the first fetch fails, so it can be
    /// retried with [`JsonStore::update_subscription`].
    pub fn create_subscription(&self, url: &str) -> Result<(Subscription, Result<usize>)> {
        let url = url.trim();
        url::Url::parse(url).map_err(|e| AppError::Other(format!("invalid subscription url: {}", e)))?;

        let sub = Subscription {
            id: uuid::Uuid::new_v4().to_string(),
            name: "New Subscription".to_string(),
            url: url.to_string(),
            updated_at: 0,
        };
        let mut subs = self.load_subscriptions()?;
        subs.push(sub.clone());
        self.save_subscriptions(&subs)?;
        info!(id = %sub.id, url = %sub.url, "subscription_created");

        let refreshed = self.update_subscription(&sub.id);
        Ok((sub, refreshed))
    }

    /// Re-download a subscription and replace its profiles. Returns the profile count.
    pub fn update_subscription(&self, id: &str) -> Result<usize> {
        let sub = self
            .load_subscriptions()?
            .into_iter()
            .find(|s| s.id == id)
            .ok_or_else(|| AppError::SubscriptionNotFound(id.to_string()))?;
        let body = fetch_body(&sub.url)?;
        self.apply_subscription(id, &body)
    }

    /// Replace the profiles owned by subscription `id` with the links in `body`.
    pub fn apply_subscription(&self, id: &str, body: &str) -> Result<usize> {
        let links = decode_subscription(body);
        let now = unix_now();
        let fresh: Vec<Profile> = links
            .iter()
            .filter_map(|link| match ConnectionDescriptor::parse(link) {
                Ok(desc) => Some(Profile {
                    id: uuid::Uuid::new_v4().to_string(),
                    name: desc.display_name().to_string(),
                    key: link.clone(),
                    subscription_id: Some(id.to_string()),
                    created_at: now,
                }),
                Err(e) => {
                    debug!(error = %e, "subscription_link_skipped");
                    None
                }
            })
            .collect();
        if fresh.is_empty() {
            return Err(AppError::Other("No valid links found".to_string()));
        }

        let mut subs = self.load_subscriptions()?;
        let sub = subs
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| AppError::SubscriptionNotFound(id.to_string()))?;
        sub.updated_at = now;

        let mut profiles = self.load_profiles()?;
        profiles.retain(|p| p.subscription_id.as_deref() != Some(id));
        let count = fresh.len();
        profiles.extend(fresh);

        self.save_subscriptions(&subs)?;
        self.save_profiles(&profiles)?;
        info!(id = %id, count = count, "subscription_updated");
        Ok(count)
    }

    /// Remove a subscription together with every profile it produced.
    pub fn delete_subscription(&self, id: &str) -> Result<()> {
        let mut subs = self.load_subscriptions()?;
        let before = subs.len();
        subs.retain(|s| s.id != id);
        if subs.len() == before {
            return Err(AppError::SubscriptionNotFound(id.to_string()));
        }
        let mut profiles = self.load_profiles()?;
        profiles.retain(|p| p.subscription_id.as_deref() != Some(id));

        self.save_subscriptions(&subs)?;
        self.save_profiles(&profiles)?;
        info!(id = %id, "subscription_deleted");
        Ok(())
    }
}

impl Store for JsonStore {
    fn load_settings(&self) -> Result<Settings> {
        let settings: Option<Settings> = config::load_json(&config::settings_path(&self.dir))?;
        Ok(settings.unwrap_or_default().normalized())
    }

    fn save_settings(&self, settings: &Settings) -> Result<()> {
        config::save_json(&config::settings_path(&self.dir), settings)
    }

    fn load_profiles(&self) -> Result<Vec<Profile>> {
        Ok(config::load_json(&config::profiles_path(&self.dir))?.unwrap_or_default())
    }
}

fn fetch_body(url: &str) -> Result<String> {
    debug!(url = %url, "subscription_fetch");
    let client = reqwest::blocking::Client::builder()
        .timeout(FETCH_TIMEOUT)
        .build()?;
    let body = client.get(url).send()?.error_for_status()?.text()?;
    Ok(body)
}

/// Extract `vless://` lines from a subscription body.
///
/// Bodies are usually base64 (any alphabet, padded or not) but plain-text
/// lists are accepted too.
#[must_use]
pub fn decode_subscription(body: &str) -> Vec<String> {
    let trimmed = body.trim();
    let compact: String = trimmed.chars().filter(|c| !c.is_whitespace()).collect();

    let decoded = [
        base64::engine::general_purpose::STANDARD,
        base64::engine::general_purpose::URL_SAFE,
        base64::engine::general_purpose::STANDARD_NO_PAD,
        base64::engine::general_purpose::URL_SAFE_NO_PAD,
    ]
    .iter()
    .find_map(|engine| engine.decode(&compact).ok())
    .and_then(|bytes| String::from_utf8(bytes).ok());

    let content = decoded.as_deref().unwrap_or(trimmed);
    let prefix = format!("{}://", link::SCHEME);
    content
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with(&prefix))
        .map(str::to_string)
        .collect()
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
