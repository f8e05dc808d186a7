//! Template resolution for paths and URLs.
//!
//! Three passes run in a fixed order: environment references (`<$HOME>`),
//! time directives (`%Y`, `%j`, `<HOURCHAR>`, ...) and keywords from a
//! flattened context (`<SITE_ID4>`, `<site_id9>`, session and metadata
//! fields). Anything a pass does not recognize is left verbatim so a template
//! can be resolved progressively.

use crate::ingest::site::{SiteId, gps_week, hour_letter};
use anyhow::{Context, Result};
use chrono::{DateTime, Timelike, Utc};
use chrono_tz::Tz;
use regex::{Captures, Regex};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::PathBuf;
use std::sync::OnceLock;

const TIME_DIRECTIVES: &str = "YymdjHMSbBaAuwUWVGgeIpZz";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TranslationContext {
    values: BTreeMap<String, String>,
}

impl TranslationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Adds the four case/length variants of a station identifier.
    pub fn insert_site(&mut self, site: &SiteId) {
        self.insert("SITE_ID4", site.four());
        self.insert("site_id4", site.four().to_ascii_lowercase());
        self.insert("SITE_ID9", site.nine());
        self.insert("site_id9", site.nine().to_ascii_lowercase());
        self.insert("SITE_ID", site.four());
        self.insert("site_id", site.four().to_ascii_lowercase());
    }

    /// Adds every field under its own name plus an upper-case alias.
    pub fn insert_fields(&mut self, fields: &BTreeMap<String, String>) {
        for (key, value) in fields {
            self.insert(key.clone(), value.clone());
            let upper = key.to_ascii_uppercase();
            if upper != *key {
                self.values.entry(upper).or_insert_with(|| value.clone());
            }
        }
    }

    pub fn merged(&self, other: &TranslationContext) -> TranslationContext {
        let mut out = self.clone();
        for (k, v) in &other.values {
            out.values.insert(k.clone(), v.clone());
        }
        out
    }
}

/// What to create on disk once a path is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MakeDir {
    No,
    /// The resolved path is a directory: create it.
    Dir,
    /// The resolved path is a file: create its parent only.
    Parent,
}

fn env_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<\$([A-Za-z_][A-Za-z0-9_]*)>").expect("env regex is valid"))
}

fn keyword_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<([A-Za-z0-9_]+)>").expect("keyword regex is valid"))
}

pub fn substitute_env(template: &str) -> String {
    env_re()
        .replace_all(template, |caps: &Captures| match env::var(&caps[1]) {
            Ok(value) => value,
            Err(_) => caps[0].to_string(),
        })
        .into_owned()
}

/// Expands strftime-style directives and the time keywords (`<HOURCHAR>`,
/// `<hourchar>`, `<GPSWEEK>`, `<GPSDOW>`) for `epoch` seen in `tz`.
/// Unknown directives and `%%` are preserved.
pub fn substitute_time(template: &str, epoch: Option<DateTime<Utc>>, tz: Tz) -> String {
    let Some(epoch) = epoch else {
        return template.to_string();
    };
    let local = epoch.with_timezone(&tz);
    let letter = hour_letter(local.hour());
    let (week, dow) = gps_week(epoch);

    let mut out = String::with_capacity(template.len() + 16);
    let mut chars = template.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch != '%' {
            out.push(ch);
            continue;
        }
        match chars.peek().copied() {
            Some('%') => {
                chars.next();
                out.push_str("%%");
            }
            Some(next) if TIME_DIRECTIVES.contains(next) => {
                chars.next();
                out.push_str(&local.format(&format!("%{next}")).to_string());
            }
            _ => out.push('%'),
        }
    }

    out.replace("<HOURCHAR>", &letter.to_ascii_uppercase().to_string())
        .replace("<hourchar>", &letter.to_string())
        .replace("<GPSWEEK>", &format!("{week:04}"))
        .replace("<GPSDOW>", &dow.to_string())
}

pub fn substitute_keywords(template: &str, ctx: &TranslationContext) -> String {
    keyword_re()
        .replace_all(template, |caps: &Captures| match ctx.get(&caps[1]) {
            Some(value) => value.to_string(),
            None => caps[0].to_string(),
        })
        .into_owned()
}

pub fn translate(
    template: &str,
    ctx: &TranslationContext,
    epoch: Option<DateTime<Utc>>,
    tz: Tz,
) -> String {
    let with_env = substitute_env(template);
    let with_time = substitute_time(&with_env, epoch, tz);
    substitute_keywords(&with_time, ctx)
}

pub fn translate_path(
    template: &str,
    ctx: &TranslationContext,
    epoch: Option<DateTime<Utc>>,
    tz: Tz,
    make_dir: MakeDir,
) -> Result<PathBuf> {
    let path = PathBuf::from(translate(template, ctx, epoch, tz));
    let target = match make_dir {
        MakeDir::No => None,
        MakeDir::Dir => Some(path.as_path()),
        MakeDir::Parent => path.parent().filter(|p| !p.as_os_str().is_empty()),
    };
    if let Some(dir) = target
        && !dir.is_dir()
    {
        fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    }
    Ok(path)
}

/// True when a resolved template still carries placeholders.
pub fn has_unresolved(resolved: &str) -> bool {
    keyword_re().is_match(resolved) || env_re().is_match(resolved)
}
