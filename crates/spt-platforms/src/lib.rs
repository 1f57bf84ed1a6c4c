//! Platform client contracts + one client per external coding platform.
//!
//! Each client translates its platform's wire format into the uniform
//! `PlatformStats` contract at exactly one conversion boundary; downstream
//! code never branches on platform-specific shapes.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use scraper::{Html, Selector};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;

use spt_core::{ErrorKind, PlatformId, PlatformStats};
use spt_store::{FetchError, PlatformFetcher};

pub const CRATE_NAME: &str = "spt-platforms";

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("user {username} not found on {platform}")]
    UserNotFound {
        platform: PlatformId,
        username: String,
    },
    #[error("malformed response from {platform}: {detail}")]
    MalformedResponse {
        platform: PlatformId,
        detail: String,
    },
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

impl PlatformError {
    /// Error-taxonomy bucket for the batch error log. Definitive failures
    /// (unknown user, unparseable body, non-retryable status) are permanent;
    /// everything else is transient.
    pub fn error_kind(&self) -> ErrorKind {
        match self {
            PlatformError::UserNotFound { .. } | PlatformError::MalformedResponse { .. } => {
                ErrorKind::PermanentApi
            }
            PlatformError::Fetch(err) if err.is_permanent() => ErrorKind::PermanentApi,
            PlatformError::Fetch(_) => ErrorKind::TransientApi,
        }
    }
}

#[async_trait]
pub trait PlatformClient: Send + Sync {
    fn platform(&self) -> PlatformId;

    /// Fetch one student's statistics. Rate limiting, retries and timeouts
    /// are handled by the fetcher; clients only classify and parse.
    async fn fetch(
        &self,
        http: &PlatformFetcher,
        username: &str,
    ) -> Result<PlatformStats, PlatformError>;
}

pub fn default_base_url(platform: PlatformId) -> &'static str {
    match platform {
        PlatformId::Codeforces => "https://codeforces.com/api",
        PlatformId::Leetcode => "https://leetcode.com/graphql",
        PlatformId::Codechef => "https://www.codechef.com",
        PlatformId::Hackerrank => "https://www.hackerrank.com",
    }
}

pub fn client_for(platform: PlatformId, base_url: &str) -> Arc<dyn PlatformClient> {
    match platform {
        PlatformId::Codeforces => Arc::new(CodeforcesClient {
            base_url: base_url.to_string(),
        }),
        PlatformId::Leetcode => Arc::new(LeetcodeClient {
            endpoint: base_url.to_string(),
        }),
        PlatformId::Codechef => Arc::new(CodechefClient {
            base_url: base_url.to_string(),
        }),
        PlatformId::Hackerrank => Arc::new(HackerrankClient {
            base_url: base_url.to_string(),
        }),
    }
}

fn malformed(platform: PlatformId, detail: impl Into<String>) -> PlatformError {
    PlatformError::MalformedResponse {
        platform,
        detail: detail.into(),
    }
}

fn parse_json_body(platform: PlatformId, body: &str) -> Result<JsonValue, PlatformError> {
    serde_json::from_str(body).map_err(|err| malformed(platform, err.to_string()))
}

fn digits_in(text: &str) -> Option<u64> {
    let digits: String = text.chars().filter(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

// ---------------------------------------------------------------------------
// Codeforces (official JSON API)
// ---------------------------------------------------------------------------

pub struct CodeforcesClient {
    pub base_url: String,
}

/// `user.info` payload: rating, max rating, titled rank.
pub fn parse_codeforces_user_info(
    body: &str,
    username: &str,
) -> Result<(i64, i64, String), PlatformError> {
    let platform = PlatformId::Codeforces;
    let value = parse_json_body(platform, body)?;
    if value.get("status").and_then(JsonValue::as_str) == Some("FAILED") {
        let comment = value
            .get("comment")
            .and_then(JsonValue::as_str)
            .unwrap_or_default();
        if comment.to_ascii_lowercase().contains("not found") {
            return Err(PlatformError::UserNotFound {
                platform,
                username: username.to_string(),
            });
        }
        return Err(malformed(platform, format!("api failure: {comment}")));
    }
    let user = value
        .get("result")
        .and_then(JsonValue::as_array)
        .and_then(|arr| arr.first())
        .ok_or_else(|| malformed(platform, "empty result array"))?;
    let rating = user.get("rating").and_then(JsonValue::as_i64).unwrap_or(0);
    let max_rating = user.get("maxRating").and_then(JsonValue::as_i64).unwrap_or(0);
    let rank_title = user
        .get("rank")
        .and_then(JsonValue::as_str)
        .unwrap_or("unrated")
        .to_string();
    Ok((rating, max_rating, rank_title))
}

/// `user.rating` payload: one entry per rated contest.
pub fn parse_codeforces_contest_count(body: &str) -> Result<u64, PlatformError> {
    let platform = PlatformId::Codeforces;
    let value = parse_json_body(platform, body)?;
    Ok(value
        .get("result")
        .and_then(JsonValue::as_array)
        .map(|arr| arr.len() as u64)
        .unwrap_or(0))
}

/// `user.status` payload: distinct problems with an OK verdict.
pub fn parse_codeforces_solved_count(body: &str) -> Result<u64, PlatformError> {
    let platform = PlatformId::Codeforces;
    let value = parse_json_body(platform, body)?;
    let submissions = value
        .get("result")
        .and_then(JsonValue::as_array)
        .ok_or_else(|| malformed(platform, "missing result array"))?;
    let mut solved = std::collections::BTreeSet::new();
    for submission in submissions {
        if submission.get("verdict").and_then(JsonValue::as_str) != Some("OK") {
            continue;
        }
        let Some(problem) = submission.get("problem") else {
            continue;
        };
        let contest_id = problem.get("contestId").and_then(JsonValue::as_i64).unwrap_or(0);
        let index = problem
            .get("index")
            .and_then(JsonValue::as_str)
            .unwrap_or_default();
        solved.insert(format!("{contest_id}-{index}"));
    }
    Ok(solved.len() as u64)
}

#[async_trait]
impl PlatformClient for CodeforcesClient {
    fn platform(&self) -> PlatformId {
        PlatformId::Codeforces
    }

    async fn fetch(
        &self,
        http: &PlatformFetcher,
        username: &str,
    ) -> Result<PlatformStats, PlatformError> {
        let platform = self.platform();
        let info_url = format!("{}/user.info?handles={username}", self.base_url);
        // Codeforces answers unknown handles with a 400 + FAILED comment.
        let info_body = match http.get_text(platform, &info_url).await {
            Ok(body) => body,
            Err(FetchError::Status { status: 400, .. }) => {
                return Err(PlatformError::UserNotFound {
                    platform,
                    username: username.to_string(),
                })
            }
            Err(err) => return Err(err.into()),
        };
        let (rating, max_rating, rank_title) = parse_codeforces_user_info(&info_body, username)?;

        let rating_url = format!("{}/user.rating?handle={username}", self.base_url);
        let contests = parse_codeforces_contest_count(&http.get_text(platform, &rating_url).await?)?;

        let status_url = format!("{}/user.status?handle={username}&from=1&count=5000", self.base_url);
        let problems = parse_codeforces_solved_count(&http.get_text(platform, &status_url).await?)?;

        let mut extra = BTreeMap::new();
        extra.insert("rank_title".to_string(), json!(rank_title));
        Ok(PlatformStats {
            rating,
            max_rating,
            problems_solved: problems,
            contests_participated: contests,
            rank: 0,
            extra,
        })
    }
}

// ---------------------------------------------------------------------------
// LeetCode (GraphQL)
// ---------------------------------------------------------------------------

pub struct LeetcodeClient {
    pub endpoint: String,
}

const LEETCODE_QUERY: &str = r#"
query userStats($username: String!) {
  matchedUser(username: $username) {
    profile { ranking }
    submitStatsGlobal { acSubmissionNum { difficulty count } }
  }
  userContestRanking(username: $username) {
    attendedContestsCount
    rating
  }
}
"#;

pub fn parse_leetcode_stats(body: &str, username: &str) -> Result<PlatformStats, PlatformError> {
    let platform = PlatformId::Leetcode;
    let value = parse_json_body(platform, body)?;

    if let Some(errors) = value.get("errors").and_then(JsonValue::as_array) {
        let combined = errors
            .iter()
            .filter_map(|e| e.get("message").and_then(JsonValue::as_str))
            .collect::<Vec<_>>()
            .join("; ");
        if combined.to_ascii_lowercase().contains("does not exist") {
            return Err(PlatformError::UserNotFound {
                platform,
                username: username.to_string(),
            });
        }
        return Err(malformed(platform, combined));
    }

    let data = value
        .get("data")
        .ok_or_else(|| malformed(platform, "missing data object"))?;
    let matched = match data.get("matchedUser") {
        Some(JsonValue::Null) | None => {
            return Err(PlatformError::UserNotFound {
                platform,
                username: username.to_string(),
            })
        }
        Some(user) => user,
    };

    let rank = matched
        .pointer("/profile/ranking")
        .and_then(JsonValue::as_u64)
        .unwrap_or(0);
    let problems = matched
        .pointer("/submitStatsGlobal/acSubmissionNum")
        .and_then(JsonValue::as_array)
        .and_then(|entries| {
            entries.iter().find(|e| {
                e.get("difficulty").and_then(JsonValue::as_str) == Some("All")
            })
        })
        .and_then(|e| e.get("count").and_then(JsonValue::as_u64))
        .unwrap_or(0);

    // Contest data is null for students who never entered a contest.
    let contest = data.get("userContestRanking");
    let contests = contest
        .and_then(|c| c.get("attendedContestsCount"))
        .and_then(JsonValue::as_u64)
        .unwrap_or(0);
    let rating = contest
        .and_then(|c| c.get("rating"))
        .and_then(JsonValue::as_f64)
        .map(|r| r.round() as i64)
        .unwrap_or(0);

    let mut extra = BTreeMap::new();
    extra.insert("contest_rating_exact".to_string(), json!(contest
        .and_then(|c| c.get("rating"))
        .and_then(JsonValue::as_f64)
        .unwrap_or(0.0)));
    Ok(PlatformStats {
        rating,
        max_rating: rating,
        problems_solved: problems,
        contests_participated: contests,
        rank,
        extra,
    })
}

#[async_trait]
impl PlatformClient for LeetcodeClient {
    fn platform(&self) -> PlatformId {
        PlatformId::Leetcode
    }

    async fn fetch(
        &self,
        http: &PlatformFetcher,
        username: &str,
    ) -> Result<PlatformStats, PlatformError> {
        let body = json!({
            "query": LEETCODE_QUERY,
            "variables": { "username": username },
        });
        let response = http.post_json(self.platform(), &self.endpoint, &body).await?;
        parse_leetcode_stats(&response, username)
    }
}

// ---------------------------------------------------------------------------
// CodeChef (scraped profile HTML)
// ---------------------------------------------------------------------------

pub struct CodechefClient {
    pub base_url: String,
}

fn select_first_text(document: &Html, selector: &str) -> Option<String> {
    let sel = Selector::parse(selector).ok()?;
    document
        .select(&sel)
        .next()
        .map(|n| n.text().collect::<String>().trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn parse_codechef_profile(body: &str, username: &str) -> Result<PlatformStats, PlatformError> {
    let platform = PlatformId::Codechef;
    let document = Html::parse_document(body);

    // Unknown handles render the generic page without a rating widget.
    let rating_text = select_first_text(&document, ".rating-number").ok_or_else(|| {
        PlatformError::UserNotFound {
            platform,
            username: username.to_string(),
        }
    })?;
    let rating = digits_in(&rating_text)
        .ok_or_else(|| malformed(platform, format!("unparseable rating {rating_text:?}")))?
        as i64;

    let max_rating = select_first_text(&document, ".rating-header small")
        .and_then(|text| digits_in(&text))
        .map(|v| v as i64)
        .unwrap_or(rating);
    let problems = select_first_text(&document, "section.problems-solved h3")
        .and_then(|text| digits_in(&text))
        .unwrap_or(0);
    let contests = select_first_text(&document, ".contest-participated-count b")
        .and_then(|text| digits_in(&text))
        .unwrap_or(0);
    let rank = select_first_text(&document, ".rating-ranks strong")
        .and_then(|text| digits_in(&text))
        .unwrap_or(0);

    let mut extra = BTreeMap::new();
    if let Some(stars) = select_first_text(&document, ".rating-star") {
        extra.insert("stars".to_string(), json!(stars.chars().count()));
    }
    Ok(PlatformStats {
        rating,
        max_rating,
        problems_solved: problems,
        contests_participated: contests,
        rank,
        extra,
    })
}

#[async_trait]
impl PlatformClient for CodechefClient {
    fn platform(&self) -> PlatformId {
        PlatformId::Codechef
    }

    async fn fetch(
        &self,
        http: &PlatformFetcher,
        username: &str,
    ) -> Result<PlatformStats, PlatformError> {
        let platform = self.platform();
        let url = format!("{}/users/{username}", self.base_url);
        let body = match http.get_text(platform, &url).await {
            Ok(body) => body,
            Err(FetchError::Status { status: 404, .. }) => {
                return Err(PlatformError::UserNotFound {
                    platform,
                    username: username.to_string(),
                })
            }
            Err(err) => return Err(err.into()),
        };
        parse_codechef_profile(&body, username)
    }
}

// ---------------------------------------------------------------------------
// HackerRank (scraped profile HTML)
// ---------------------------------------------------------------------------

pub struct HackerrankClient {
    pub base_url: String,
}

/// HackerRank has no rating ladder; rating, max rating, contests and rank
/// stay zero-valued per the uniform contract.
pub fn parse_hackerrank_profile(body: &str, username: &str) -> Result<PlatformStats, PlatformError> {
    let platform = PlatformId::Hackerrank;
    let document = Html::parse_document(body);

    if select_first_text(&document, ".profile-username").is_none() {
        return Err(PlatformError::UserNotFound {
            platform,
            username: username.to_string(),
        });
    }

    let problems = select_first_text(&document, ".challenges-solved .value")
        .and_then(|text| digits_in(&text))
        .unwrap_or(0);
    let badge_sel = Selector::parse(".hacker-badge")
        .map_err(|err| malformed(platform, err.to_string()))?;
    let badges = document.select(&badge_sel).count();

    let mut extra = BTreeMap::new();
    extra.insert("badges".to_string(), json!(badges));
    Ok(PlatformStats {
        problems_solved: problems,
        extra,
        ..PlatformStats::default()
    })
}

#[async_trait]
impl PlatformClient for HackerrankClient {
    fn platform(&self) -> PlatformId {
        PlatformId::Hackerrank
    }

    async fn fetch(
        &self,
        http: &PlatformFetcher,
        username: &str,
    ) -> Result<PlatformStats, PlatformError> {
        let platform = self.platform();
        let url = format!("{}/profile/{username}", self.base_url);
        let body = match http.get_text(platform, &url).await {
            Ok(body) => body,
            Err(FetchError::Status { status: 404, .. }) => {
                return Err(PlatformError::UserNotFound {
                    platform,
                    username: username.to_string(),
                })
            }
            Err(err) => return Err(err.into()),
        };
        parse_hackerrank_profile(&body, username)
    }
}
