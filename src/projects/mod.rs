//! Image project records and the dashboard views computed over them.
//!
//! Projects are written by the generation pipeline (out of process) and read
//! here for the dashboard: listing with search and sort, owner-scoped
//! deletion, and the usage counters shown on the overview page.

use chrono::{DateTime, Datelike, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Window used for the "this week" counter.
const WEEK_DAYS: i64 = 7;

/// A generated image and the parameters that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageProject {
    pub id: String,
    pub user_id: String,
    pub name: Option<String>,
    pub prompt: String,
    pub negative_prompt: Option<String>,
    /// Public URL of the stored image.
    pub image_url: String,
    /// Object-store key of the image.
    pub s3_key: String,
    pub width: u32,
    pub height: u32,
    pub num_inference_steps: u32,
    pub guidance_scale: f64,
    pub seed: i64,
    pub model_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Sort order for project listings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortBy {
    #[default]
    Newest,
    Oldest,
    /// Alphabetical by prompt, ignoring case.
    Prompt,
}

/// Listing filter, deserialized from the query string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ProjectQuery {
    /// Case-insensitive substring matched against the prompt.
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default)]
    pub sort: SortBy,
}

/// Filter and order projects for display.
pub fn apply_query(mut projects: Vec<ImageProject>, query: &ProjectQuery) -> Vec<ImageProject> {
    if let Some(needle) = query
        .search
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        let needle = needle.to_lowercase();
        projects.retain(|p| p.prompt.to_lowercase().contains(&needle));
    }

    match query.sort {
        SortBy::Newest => projects.sort_by(|a, b| b.created_at.cmp(&a.created_at)),
        SortBy::Oldest => projects.sort_by(|a, b| a.created_at.cmp(&b.created_at)),
        SortBy::Prompt => projects.sort_by_cached_key(|p| p.prompt.to_lowercase()),
    }

    projects
}

/// Usage counters for the dashboard overview.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStats {
    pub total_image_projects: usize,
    /// Projects created since the start of the current UTC month.
    pub this_month: usize,
    /// Projects created in the last seven days.
    pub this_week: usize,
}

impl UserStats {
    pub fn compute(projects: &[ImageProject], now: DateTime<Utc>) -> Self {
        let month_start = month_start(now);
        let week_start = now - Duration::days(WEEK_DAYS);

        Self {
            total_image_projects: projects.len(),
            this_month: projects
                .iter()
                .filter(|p| p.created_at >= month_start)
                .count(),
            this_week: projects
                .iter()
                .filter(|p| p.created_at >= week_start)
                .count(),
        }
    }
}

fn month_start(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive()
        .with_day(1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map_or(now, |dt| dt.and_utc())
}

#[cfg(test)]
pub(crate) fn sample_project(id: &str, user_id: &str, prompt: &str, created_at: DateTime<Utc>) -> ImageProject {
    ImageProject {
        id: id.into(),
        user_id: user_id.into(),
        name: None,
        prompt: prompt.into(),
        negative_prompt: None,
        image_url: format!("https://images.example.com/{id}.png"),
        s3_key: format!("{user_id}/{id}.png"),
        width: 1024,
        height: 1024,
        num_inference_steps: 28,
        guidance_scale: 3.5,
        seed: 42,
        model_id: "sdxl-turbo".into(),
        created_at,
        updated_at: created_at,
    }
}
