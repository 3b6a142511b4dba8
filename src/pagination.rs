//! Pagination routing across upstreams.
//!
//! List-style downstream requests fan out over many upstreams, each with its
//! own inner cursor. This module folds them behind one opaque composite
//! cursor (`base64(clientName:innerCursor)`). Unreadable cursors are logged
//! and treated as "start"; a cursor pointing at a vanished upstream falls
//! back to the first available one.

use std::future::Future;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::warn;

use crate::error::ProxyResult;

pub const MAX_CURSOR_LEN: usize = 1000;

static CLIENT_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,100}$").expect("client name pattern"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompositeCursor {
    pub client: String,
    pub inner: Option<String>,
}

impl CompositeCursor {
    pub fn new(client: impl Into<String>, inner: Option<String>) -> Self {
        Self {
            client: client.into(),
            inner,
        }
    }

    pub fn encode(&self) -> String {
        BASE64.encode(format!(
            "{}:{}",
            self.client,
            self.inner.as_deref().unwrap_or("")
        ))
    }

    /// `None` for anything unreadable: bad base64, bad client name, oversized.
    pub fn decode(raw: &str) -> Option<Self> {
        if raw.len() > MAX_CURSOR_LEN {
            return None;
        }
        let decoded = BASE64.decode(raw).ok()?;
        let text = String::from_utf8(decoded).ok()?;
        let (client, inner) = text.split_once(':')?;
        if !CLIENT_NAME.is_match(client) {
            return None;
        }
        Some(Self {
            client: client.to_string(),
            inner: if inner.is_empty() {
                None
            } else {
                Some(inner.to_string())
            },
        })
    }
}

/// One upstream's answer to a list call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamPage<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<String>,
}

/// The unified downstream page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutedPage<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<String>,
}

pub struct PaginationRouter;

impl PaginationRouter {
    /// Route a list request across `upstreams` (in map order).
    ///
    /// Non-paginated mode drains every upstream into a single response.
    /// Paginated mode makes exactly one upstream call per downstream call and
    /// stitches the composite cursor.
    pub async fn route<T, F, Fut>(
        upstreams: &[String],
        cursor: Option<&str>,
        paginated: bool,
        fetch: F,
    ) -> ProxyResult<RoutedPage<T>>
    where
        F: Fn(String, Option<String>) -> Fut,
        Fut: Future<Output = ProxyResult<UpstreamPage<T>>>,
    {
        if upstreams.is_empty() {
            return Ok(RoutedPage {
                items: Vec::new(),
                next_cursor: None,
            });
        }

        if !paginated {
            let mut items = Vec::new();
            for upstream in upstreams {
                let mut inner = None;
                loop {
                    let page = fetch(upstream.clone(), inner).await?;
                    items.extend(page.items);
                    match page.next_cursor {
                        Some(next) => inner = Some(next),
                        None => break,
                    }
                }
            }
            return Ok(RoutedPage {
                items,
                next_cursor: None,
            });
        }

        let (index, inner) = Self::starting_position(upstreams, cursor);
        let upstream = upstreams[index].clone();
        let page = fetch(upstream.clone(), inner).await?;

        let next_cursor = match page.next_cursor {
            Some(inner) => Some(CompositeCursor::new(upstream, Some(inner)).encode()),
            None => upstreams
                .get(index + 1)
                .map(|next| CompositeCursor::new(next.clone(), None).encode()),
        };

        Ok(RoutedPage {
            items: page.items,
            next_cursor,
        })
    }

    fn starting_position(upstreams: &[String], cursor: Option<&str>) -> (usize, Option<String>) {
        let Some(raw) = cursor else {
            return (0, None);
        };
        let Some(decoded) = CompositeCursor::decode(raw) else {
            warn!("unreadable pagination cursor {raw:?}, starting from the beginning");
            return (0, None);
        };
        match upstreams.iter().position(|name| *name == decoded.client) {
            Some(index) => (index, decoded.inner),
            None => {
                warn!(
                    "cursor upstream '{}' is gone, migrating to '{}'",
                    decoded.client, upstreams[0]
                );
                (0, None)
            }
        }
    }
}
