use anyhow::{Context, Result, bail};
use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::config::{MigrateConfig, secret};
use crate::http::{HttpSettings, ensure_success};
use crate::model::{Page, PageFormat, SourceSpace, SourceTicket, SourceUser, parse_timestamp};

const WIKI_PAGES_PER_PAGE: usize = 10;
const TICKETS_PER_PAGE: usize = 100;

/// Metadata of a stored document (image or file) in the source system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentMeta {
    pub id: String,
    pub name: String,
    pub filename: String,
    pub content_type: String,
    pub filesize: Option<i64>,
    pub url: String,
}

pub trait SourceApi {
    fn get_spaces(&mut self) -> Result<Vec<SourceSpace>>;
    fn get_wiki_pages(&mut self, space_id: &str) -> Result<Vec<Page>>;
    fn get_users(&mut self, space_id: &str) -> Result<Vec<SourceUser>>;
    fn get_tickets(&mut self, space_id: &str, report: u32) -> Result<Vec<SourceTicket>>;
    /// `Ok(None)` when the document does not exist.
    fn get_document(&mut self, space_id: &str, document_id: &str) -> Result<Option<DocumentMeta>>;
    fn download(&mut self, url: &str) -> Result<Vec<u8>>;
    fn request_count(&self) -> usize;
}

#[derive(Debug, Clone)]
pub struct AssemblaClientConfig {
    pub api_url: String,
    pub api_key: String,
    pub api_secret: String,
    pub http: HttpSettings,
}

impl AssemblaClientConfig {
    pub fn from_config(config: &MigrateConfig) -> Result<Self> {
        let api_key = secret("ASSEMBLA_API_KEY")
            .ok_or_else(|| anyhow::anyhow!("ASSEMBLA_API_KEY is not set"))?;
        let api_secret = secret("ASSEMBLA_API_SECRET")
            .ok_or_else(|| anyhow::anyhow!("ASSEMBLA_API_SECRET is not set"))?;
        Ok(Self {
            api_url: config.source_api_url().trim_end_matches('/').to_string(),
            api_key,
            api_secret,
            http: HttpSettings::from_config(config),
        })
    }
}

pub struct AssemblaClient {
    client: Client,
    config: AssemblaClientConfig,
    request_count: usize,
}

impl AssemblaClient {
    pub fn new(config: AssemblaClientConfig) -> Result<Self> {
        let client = config.http.build_client("source API")?;
        Ok(Self {
            client,
            config,
            request_count: 0,
        })
    }

    fn authorized(&mut self, builder: RequestBuilder) -> RequestBuilder {
        self.request_count += 1;
        builder
            .header("X-Api-Key", self.config.api_key.clone())
            .header("X-Api-Secret", self.config.api_secret.clone())
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.config.api_url, path.trim_start_matches('/'))
    }

    fn get_json<T: DeserializeOwned>(&mut self, path: &str) -> Result<T> {
        let url = self.endpoint(path);
        let builder = self.client.get(&url);
        let response = self
            .authorized(builder)
            .send()
            .with_context(|| format!("failed to call source API {url}"))?;
        ensure_success(response, "source API")?
            .json()
            .with_context(|| format!("failed to decode source API response from {url}"))
    }

    /// Walk `page=1..` until an empty page, HTTP 204, or a page shorter than `per_page`.
    fn get_paged<T: DeserializeOwned>(
        &mut self,
        path: &str,
        extra: &[(&str, String)],
        per_page: usize,
    ) -> Result<Vec<T>> {
        let url = self.endpoint(path);
        let mut items = Vec::new();
        let mut page = 1usize;
        loop {
            let mut query = vec![
                ("page".to_string(), page.to_string()),
                ("per_page".to_string(), per_page.to_string()),
            ];
            query.extend(extra.iter().map(|(k, v)| ((*k).to_string(), v.clone())));
            let builder = self.client.get(&url).query(&query);
            let response = self
                .authorized(builder)
                .send()
                .with_context(|| format!("failed to call source API {url} (page {page})"))?;
            if response.status() == StatusCode::NO_CONTENT {
                break;
            }
            let batch: Vec<T> = ensure_success(response, "source API")?
                .json()
                .with_context(|| format!("failed to decode {url} page {page}"))?;
            let count = batch.len();
            tracing::debug!(url = %url, page, count, "fetched source page");
            items.extend(batch);
            if count == 0 || count < per_page {
                break;
            }
            page += 1;
        }
        Ok(items)
    }
}

impl SourceApi for AssemblaClient {
    fn get_spaces(&mut self) -> Result<Vec<SourceSpace>> {
        let wire: Vec<WireSpace> = self.get_json("spaces.json")?;
        wire.into_iter().map(WireSpace::validate).collect()
    }

    fn get_wiki_pages(&mut self, space_id: &str) -> Result<Vec<Page>> {
        let wire: Vec<WirePage> = self.get_paged(
            &format!("spaces/{space_id}/wiki_pages.json"),
            &[],
            WIKI_PAGES_PER_PAGE,
        )?;
        wire.into_iter().map(WirePage::validate).collect()
    }

    fn get_users(&mut self, space_id: &str) -> Result<Vec<SourceUser>> {
        let wire: Vec<WireUser> = self.get_json(&format!("spaces/{space_id}/users.json"))?;
        wire.into_iter().map(WireUser::validate).collect()
    }

    fn get_tickets(&mut self, space_id: &str, report: u32) -> Result<Vec<SourceTicket>> {
        let wire: Vec<WireTicket> = self.get_paged(
            &format!("spaces/{space_id}/tickets.json"),
            &[
                ("report", report.to_string()),
                ("sort_by", "number".to_string()),
            ],
            TICKETS_PER_PAGE,
        )?;
        wire.into_iter().map(WireTicket::validate).collect()
    }

    fn get_document(&mut self, space_id: &str, document_id: &str) -> Result<Option<DocumentMeta>> {
        let url = self.endpoint(&format!("spaces/{space_id}/documents/{document_id}.json"));
        let builder = self.client.get(&url);
        let response = self
            .authorized(builder)
            .send()
            .with_context(|| format!("failed to call source API {url}"))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let wire: WireDocument = ensure_success(response, "source API")?
            .json()
            .with_context(|| format!("failed to decode document {document_id}"))?;
        wire.validate().map(Some)
    }

    fn download(&mut self, url: &str) -> Result<Vec<u8>> {
        let builder = self.client.get(url);
        let response = self
            .authorized(builder)
            .send()
            .with_context(|| format!("failed to download {url}"))?;
        let bytes = ensure_success(response, "source download")?
            .bytes()
            .with_context(|| format!("failed to read download body from {url}"))?;
        Ok(bytes.to_vec())
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

#[derive(Debug, Deserialize)]
struct WireSpace {
    id: Option<String>,
    name: Option<String>,
    wiki_name: Option<String>,
}

impl WireSpace {
    fn validate(self) -> Result<SourceSpace> {
        let Some(id) = self.id else {
            bail!("source space without id");
        };
        let name = self.name.unwrap_or_default();
        Ok(SourceSpace {
            wiki_name: self.wiki_name.unwrap_or_else(|| name.clone()),
            id,
            name,
        })
    }
}

#[derive(Debug, Deserialize)]
struct WirePage {
    id: Option<String>,
    parent_id: Option<String>,
    page_name: Option<String>,
    contents: Option<String>,
    wiki_format: Option<i64>,
    user_id: Option<String>,
    created_at: Option<String>,
}

impl WirePage {
    fn validate(self) -> Result<Page> {
        let Some(id) = self.id.filter(|id| !id.trim().is_empty()) else {
            bail!("wiki page without id");
        };
        let Some(title) = self.page_name.filter(|name| !name.trim().is_empty()) else {
            bail!("wiki page {id} has no page_name");
        };
        let created_at = self
            .created_at
            .as_deref()
            .and_then(parse_timestamp)
            .ok_or_else(|| anyhow::anyhow!("wiki page {id} has missing or invalid created_at"))?;
        Ok(Page {
            parent_id: self.parent_id.filter(|parent| !parent.trim().is_empty()),
            title,
            body: self.contents.unwrap_or_default(),
            format: PageFormat::from_wiki_format(self.wiki_format.unwrap_or_default()),
            created_at,
            author_id: self.user_id,
            id,
        })
    }
}

#[derive(Debug, Deserialize)]
struct WireUser {
    id: Option<String>,
    login: Option<String>,
    name: Option<String>,
}

impl WireUser {
    fn validate(self) -> Result<SourceUser> {
        let Some(id) = self.id else {
            bail!("source user without id");
        };
        let login = self.login.unwrap_or_default();
        Ok(SourceUser {
            name: self.name.unwrap_or_else(|| login.clone()),
            id,
            login,
        })
    }
}

#[derive(Debug, Deserialize)]
struct WireTicket {
    id: Option<Value>,
    number: Option<u64>,
    summary: Option<String>,
}

impl WireTicket {
    fn validate(self) -> Result<SourceTicket> {
        let (Some(id), Some(number)) = (self.id.and_then(id_string), self.number) else {
            bail!("source ticket without id or number");
        };
        Ok(SourceTicket {
            id,
            number,
            summary: self.summary.unwrap_or_default(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct WireDocument {
    id: Option<String>,
    name: Option<String>,
    filename: Option<String>,
    content_type: Option<String>,
    filesize: Option<i64>,
    url: Option<String>,
}

impl WireDocument {
    fn validate(self) -> Result<DocumentMeta> {
        let Some(id) = self.id else {
            bail!("document without id");
        };
        let Some(url) = self.url.filter(|url| !url.is_empty()) else {
            bail!("document {id} has no download url");
        };
        let name = self.name.unwrap_or_default();
        let filename = self
            .filename
            .filter(|filename| !filename.is_empty())
            .unwrap_or_else(|| if name.is_empty() { id.clone() } else { name.clone() });
        Ok(DocumentMeta {
            content_type: self
                .content_type
                .unwrap_or_else(|| "application/octet-stream".to_string()),
            filesize: self.filesize,
            id,
            name,
            filename,
            url,
        })
    }
}

/// Ticket ids arrive as numbers, everything else as strings.
fn id_string(value: Value) -> Option<String> {
    match value {
        Value::String(text) if !text.is_empty() => Some(text),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::{BTreeMap, BTreeSet};

    use super::*;

    #[derive(Default)]
    pub(crate) struct MockSource {
        pub spaces: Vec<SourceSpace>,
        pub pages: Vec<Page>,
        pub users: Vec<SourceUser>,
        pub tickets: Vec<SourceTicket>,
        pub documents: BTreeMap<String, DocumentMeta>,
        pub files: BTreeMap<String, Vec<u8>>,
        pub failing_documents: BTreeSet<String>,
        pub document_lookups: Vec<String>,
        pub downloads: Vec<String>,
        pub requests: usize,
    }

    impl MockSource {
        pub fn with_document(mut self, id: &str, filename: &str, content_type: &str) -> Self {
            let url = format!("https://files.example.com/{id}");
            self.files.insert(url.clone(), format!("bytes of {id}").into_bytes());
            self.documents.insert(
                id.to_string(),
                DocumentMeta {
                    id: id.to_string(),
                    name: filename.to_string(),
                    filename: filename.to_string(),
                    content_type: content_type.to_string(),
                    filesize: Some(10),
                    url,
                },
            );
            self
        }
    }

    impl SourceApi for MockSource {
        fn get_spaces(&mut self) -> Result<Vec<SourceSpace>> {
            self.requests += 1;
            Ok(self.spaces.clone())
        }

        fn get_wiki_pages(&mut self, _space_id: &str) -> Result<Vec<Page>> {
            self.requests += 1;
            Ok(self.pages.clone())
        }

        fn get_users(&mut self, _space_id: &str) -> Result<Vec<SourceUser>> {
            self.requests += 1;
            Ok(self.users.clone())
        }

        fn get_tickets(&mut self, _space_id: &str, _report: u32) -> Result<Vec<SourceTicket>> {
            self.requests += 1;
            Ok(self.tickets.clone())
        }

        fn get_document(
            &mut self,
            _space_id: &str,
            document_id: &str,
        ) -> Result<Option<DocumentMeta>> {
            self.requests += 1;
            self.document_lookups.push(document_id.to_string());
            if self.failing_documents.contains(document_id) {
                bail!("source API request failed with HTTP 500 Internal Server Error");
            }
            Ok(self.documents.get(document_id).cloned())
        }

        fn download(&mut self, url: &str) -> Result<Vec<u8>> {
            self.requests += 1;
            self.downloads.push(url.to_string());
            self.files
                .get(url)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("source download request failed with HTTP 404"))
        }

        fn request_count(&self) -> usize {
            self.requests
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wiki_page_requires_id_and_title() {
        let page: WirePage = serde_json::from_str(
            r#"{"id":"p1","page_name":"Home","contents":"<p>x</p>","wiki_format":3,
                "parent_id":null,"user_id":"u1","created_at":"2015-03-11T10:36:38.000Z"}"#,
        )
        .expect("decode");
        let page = page.validate().expect("valid page");
        assert_eq!(page.format, PageFormat::Html);
        assert_eq!(page.parent_id, None);

        let untitled: WirePage =
            serde_json::from_str(r#"{"id":"p2","created_at":"2015-03-11T10:36:38Z"}"#)
                .expect("decode");
        let error = untitled.validate().expect_err("must fail");
        assert!(error.to_string().contains("p2 has no page_name"));

        let anonymous: WirePage =
            serde_json::from_str(r#"{"page_name":"Lost","created_at":"2015-03-11T10:36:38Z"}"#)
                .expect("decode");
        assert!(anonymous.validate().is_err());
    }

    #[test]
    fn non_html_formats_are_plain_and_blank_parent_is_root() {
        let page: WirePage = serde_json::from_str(
            r#"{"id":"p1","page_name":"Notes","wiki_format":1,"parent_id":"",
                "created_at":"2015-03-11 10:36:38"}"#,
        )
        .expect("decode");
        let page = page.validate().expect("valid page");
        assert_eq!(page.format, PageFormat::Plain);
        assert_eq!(page.parent_id, None);
        assert_eq!(page.body, "");
    }

    #[test]
    fn numeric_ticket_ids_are_accepted() {
        let ticket: WireTicket =
            serde_json::from_str(r#"{"id":81234,"number":7,"summary":"Crash"}"#).expect("decode");
        let ticket = ticket.validate().expect("valid ticket");
        assert_eq!(ticket.id, "81234");
        assert_eq!(ticket.number, 7);
    }

    #[test]
    fn document_filename_falls_back_to_name() {
        let document: WireDocument = serde_json::from_str(
            r#"{"id":"DOC1","name":"diagram.png","content_type":"image/png",
                "url":"https://files.example.com/DOC1"}"#,
        )
        .expect("decode");
        let meta = document.validate().expect("valid document");
        assert_eq!(meta.filename, "diagram.png");
        assert_eq!(meta.content_type, "image/png");

        let no_url: WireDocument =
            serde_json::from_str(r#"{"id":"DOC2","name":"x"}"#).expect("decode");
        assert!(no_url.validate().is_err());
    }
}
