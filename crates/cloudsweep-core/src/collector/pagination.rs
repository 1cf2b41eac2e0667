use super::transport::{ApiRequest, ApiTransport, TransportError};
use crate::schema::Paging;
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Pages fetched for one request, plus the error that stopped it early.
#[derive(Debug, Default)]
pub(crate) struct PageRun {
    pub pages: Vec<Value>,
    pub error: Option<TransportError>,
}

/// Issue `request`, following continuation cursors while `paging` is set.
///
/// Stops when the provider omits the cursor, returns a page with no records,
/// or `max_pages` is reached. Each page holds one permit of `gate` while in
/// flight.
pub(crate) async fn fetch_pages<F>(
    transport: &dyn ApiTransport,
    gate: &Semaphore,
    mut request: ApiRequest,
    paging: Option<&Paging>,
    max_pages: usize,
    page_len: F,
) -> PageRun
where
    F: Fn(&Value) -> usize,
{
    let mut run = PageRun::default();

    loop {
        let response = {
            let Ok(_permit) = gate.acquire().await else {
                run.error = Some(TransportError::Network("request gate closed".to_string()));
                return run;
            };
            debug!(endpoint = %request.endpoint, url = %request.url, page = run.pages.len() + 1, "sending request");
            transport.send(&request).await
        };

        let body = match response {
            Ok(body) => body,
            Err(error) => {
                run.error = Some(error);
                return run;
            }
        };

        let records = page_len(&body);
        let cursor = paging.and_then(|p| next_cursor(&body, &p.cursor_field));
        run.pages.push(body);

        let (Some(paging), Some(cursor)) = (paging, cursor) else {
            break;
        };
        if records == 0 {
            break;
        }
        if run.pages.len() >= max_pages {
            warn!(endpoint = %request.endpoint, max_pages, "page limit reached; results truncated");
            break;
        }
        set_query(&mut request.query, &paging.cursor_param, cursor);
    }

    run
}

fn next_cursor(body: &Value, field: &str) -> Option<String> {
    body.get(field)
        .and_then(Value::as_str)
        .filter(|cursor| !cursor.is_empty())
        .map(str::to_string)
}

fn set_query(query: &mut Vec<(String, String)>, name: &str, value: String) {
    match query.iter_mut().find(|(key, _)| key == name) {
        Some(entry) => entry.1 = value,
        None => query.push((name.to_string(), value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::transport::FixtureTransport;
    use crate::schema::{EndpointId, HttpMethod};
    use serde_json::json;

    const URL: &str = "https://compute/projects/p/global/firewalls";

    fn request() -> ApiRequest {
        ApiRequest {
            endpoint: EndpointId::new("firewalls", "list"),
            method: HttpMethod::Get,
            url: URL.to_string(),
            query: Vec::new(),
        }
    }

    fn page(size: usize, start: usize, cursor: Option<&str>) -> Value {
        let items: Vec<Value> = (start..start + size).map(|i| json!({"id": i})).collect();
        match cursor {
            Some(c) => json!({"items": items, "nextPageToken": c}),
            None => json!({"items": items}),
        }
    }

    fn items(body: &Value) -> usize {
        body.get("items").and_then(Value::as_array).map_or(0, Vec::len)
    }

    #[tokio::test]
    async fn test_follows_cursors_until_absent() {
        let transport = FixtureTransport::new()
            .respond(URL, page(10, 0, Some("t1")))
            .respond_with_query(URL, &[("pageToken", "t1")], page(10, 10, Some("t2")))
            .respond_with_query(URL, &[("pageToken", "t2")], page(5, 20, None));
        let gate = Semaphore::new(1);

        let run = fetch_pages(&transport, &gate, request(), Some(&Paging::default()), 100, items).await;

        assert!(run.error.is_none());
        assert_eq!(transport.request_count(), 3);
        let total: usize = run.pages.iter().map(items).sum();
        assert_eq!(total, 25);
        assert_eq!(run.pages[2]["items"][0]["id"], 20);
    }

    #[tokio::test]
    async fn test_empty_page_stops_even_with_cursor() {
        let transport = FixtureTransport::new().respond(URL, json!({"items": [], "nextPageToken": "again"}));
        let gate = Semaphore::new(1);

        let run = fetch_pages(&transport, &gate, request(), Some(&Paging::default()), 100, items).await;
        assert_eq!(run.pages.len(), 1);
        assert_eq!(transport.request_count(), 1);
    }

    #[tokio::test]
    async fn test_unpaginated_ignores_cursor() {
        let transport = FixtureTransport::new().respond(URL, page(3, 0, Some("t1")));
        let gate = Semaphore::new(1);

        let run = fetch_pages(&transport, &gate, request(), None, 100, items).await;
        assert_eq!(run.pages.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_later_page_keeps_earlier_pages() {
        let transport = FixtureTransport::new().respond(URL, page(2, 0, Some("gone")));
        let gate = Semaphore::new(1);

        let run = fetch_pages(&transport, &gate, request(), Some(&Paging::default()), 100, items).await;
        assert_eq!(run.pages.len(), 1);
        assert!(matches!(run.error, Some(TransportError::Status { status: 404, .. })));
    }

    #[tokio::test]
    async fn test_page_limit() {
        let transport = FixtureTransport::new()
            .respond(URL, page(1, 0, Some("t1")))
            .respond_with_query(URL, &[("pageToken", "t1")], page(1, 1, Some("t2")));
        let gate = Semaphore::new(1);

        let run = fetch_pages(&transport, &gate, request(), Some(&Paging::default()), 2, items).await;
        assert_eq!(run.pages.len(), 2);
        assert!(run.error.is_none());
    }
}
