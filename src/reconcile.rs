//! Status reconciliation for externally running backends.
//!
//! After a proxy restart, backend processes may still be serving even though
//! no group owns them. For models that look stopped, we probe their upstream
//! URL for an OpenAI-style model listing and mark matches ready. At most one
//! probe is issued per distinct URL; probe failures are silent.

use crate::manager::{HttpClient, ModelView};
use axum::body::Body;
use http_body_util::BodyExt;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

const PROBE_TIMEOUT: Duration = Duration::from_millis(750);

/// A stopped/unknown model worth probing.
pub struct ProbeCandidate {
    /// Index into the views slice being reconciled
    pub index: usize,
    /// Upstream base URL
    pub proxy: String,
    /// Names that identify this model in a listing (primary ID and alias)
    pub keys: Vec<String>,
}

pub fn normalize_model_key(key: &str) -> String {
    key.trim().to_lowercase()
}

#[derive(Deserialize)]
struct Listing {
    #[serde(default)]
    data: Vec<ListedModel>,
}

#[derive(Deserialize)]
struct ListedModel {
    #[serde(default)]
    id: String,
}

/// Fetch the set of model IDs an upstream claims to serve, normalised.
/// Returns an empty set on any failure.
pub async fn detect_served_model_ids(client: &HttpClient, proxy_url: &str) -> HashSet<String> {
    let mut result = HashSet::new();
    let base = proxy_url.trim().trim_end_matches('/');
    if base.is_empty() {
        return result;
    }

    for endpoint in [format!("{base}/v1/models"), format!("{base}/models")] {
        let Ok(uri) = endpoint.parse::<hyper::Uri>() else {
            continue;
        };
        let Ok(request) = http::Request::get(uri).body(Body::empty()) else {
            continue;
        };

        let Ok(Ok(response)) = tokio::time::timeout(PROBE_TIMEOUT, client.request(request)).await
        else {
            continue;
        };
        if response.status() != http::StatusCode::OK {
            continue;
        }
        let Ok(Ok(collected)) =
            tokio::time::timeout(PROBE_TIMEOUT, response.into_body().collect()).await
        else {
            continue;
        };
        let Ok(listing) = serde_json::from_slice::<Listing>(&collected.to_bytes()) else {
            continue;
        };

        for model in listing.data {
            let key = normalize_model_key(&model.id);
            if !key.is_empty() {
                result.insert(key);
            }
        }
        if !result.is_empty() {
            return result;
        }
    }

    result
}

/// Flip candidate views to `ready` when their upstream already serves them.
pub async fn mark_externally_served(
    client: &HttpClient,
    views: &mut [ModelView],
    candidates: Vec<ProbeCandidate>,
) {
    let mut served_by_proxy: HashMap<String, HashSet<String>> = HashMap::new();

    for candidate in candidates {
        let proxy_url = candidate.proxy.trim().to_string();
        if proxy_url.is_empty() {
            continue;
        }

        if !served_by_proxy.contains_key(&proxy_url) {
            let served = detect_served_model_ids(client, &proxy_url).await;
            served_by_proxy.insert(proxy_url.clone(), served);
        }
        let served = &served_by_proxy[&proxy_url];
        if served.is_empty() {
            continue;
        }

        for key in &candidate.keys {
            let normalized = normalize_model_key(key);
            if normalized.is_empty() {
                continue;
            }
            if served.contains(&normalized) {
                views[candidate.index].state = "ready".to_string();
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Json, Router, routing::get};
    use hyper_util::client::legacy::Client;
    use hyper_util::rt::TokioExecutor;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;

    fn test_client() -> HttpClient {
        Client::builder(TokioExecutor::new()).build_http()
    }

    fn view(id: &str) -> ModelView {
        ModelView {
            id: id.to_string(),
            name: String::new(),
            description: String::new(),
            state: "stopped".to_string(),
            unlisted: false,
            peer_id: String::new(),
        }
    }

    /// Serve `{"data":[{"id": ...}]}` on /v1/models, counting hits.
    async fn stub_upstream(ids: Vec<&'static str>) -> (String, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = Arc::clone(&hits);
        let app = Router::new().route(
            "/v1/models",
            get(move || {
                hits_clone.fetch_add(1, Ordering::SeqCst);
                let data: Vec<_> = ids
                    .iter()
                    .map(|id| serde_json::json!({"id": id, "object": "model"}))
                    .collect();
                async move { Json(serde_json::json!({"object": "list", "data": data})) }
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), hits)
    }

    #[test]
    fn test_normalize_model_key() {
        assert_eq!(normalize_model_key("  Llama-3  "), "llama-3");
        assert_eq!(normalize_model_key(""), "");
    }

    #[tokio::test]
    async fn test_detect_served_model_ids() {
        let (url, _) = stub_upstream(vec!["Llama-3", "qwen"]).await;
        let served = detect_served_model_ids(&test_client(), &url).await;
        assert!(served.contains("llama-3"));
        assert!(served.contains("qwen"));
    }

    #[tokio::test]
    async fn test_detect_unreachable_is_silent() {
        let served = detect_served_model_ids(&test_client(), "http://127.0.0.1:1").await;
        assert!(served.is_empty());
    }

    #[tokio::test]
    async fn test_mark_externally_served_flips_state() {
        let (url, _) = stub_upstream(vec!["m"]).await;
        let mut views = vec![view("m"), view("other")];
        let candidates = vec![
            ProbeCandidate {
                index: 0,
                proxy: url.clone(),
                keys: vec!["m".to_string(), String::new()],
            },
            ProbeCandidate {
                index: 1,
                proxy: "http://127.0.0.1:1".to_string(),
                keys: vec!["other".to_string(), String::new()],
            },
        ];

        mark_externally_served(&test_client(), &mut views, candidates).await;
        assert_eq!(views[0].state, "ready");
        assert_eq!(views[1].state, "stopped");
    }

    #[tokio::test]
    async fn test_alias_matches_listing() {
        let (url, _) = stub_upstream(vec!["GPT-4"]).await;
        let mut views = vec![view("qwen")];
        let candidates = vec![ProbeCandidate {
            index: 0,
            proxy: url,
            keys: vec!["qwen".to_string(), "gpt-4".to_string()],
        }];

        mark_externally_served(&test_client(), &mut views, candidates).await;
        assert_eq!(views[0].state, "ready");
    }

    #[tokio::test]
    async fn test_one_probe_per_distinct_url() {
        let (url, hits) = stub_upstream(vec!["a", "b"]).await;
        let mut views = vec![view("a"), view("b")];
        let candidates = vec![
            ProbeCandidate {
                index: 0,
                proxy: url.clone(),
                keys: vec!["a".to_string()],
            },
            ProbeCandidate {
                index: 1,
                proxy: url,
                keys: vec!["b".to_string()],
            },
        ];

        mark_externally_served(&test_client(), &mut views, candidates).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(views[0].state, "ready");
        assert_eq!(views[1].state, "ready");
    }
}
