use anyhow::{Context, Result, bail};
use reqwest::blocking::multipart::{Form, Part};
use reqwest::blocking::{Client, RequestBuilder};
use serde::Deserialize;
use serde_json::json;

use crate::config::{MigrateConfig, secret};
use crate::http::{HttpSettings, ensure_success};

#[derive(Debug, Clone)]
pub struct CreatePageRequest<'a> {
    pub title: &'a str,
    pub body: &'a str,
    pub parent_id: Option<&'a str>,
    /// 1-based position in the publish order, used for progress output.
    pub position: usize,
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetPage {
    pub id: String,
    pub title: String,
    pub version: u64,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetAttachment {
    pub id: String,
    pub title: String,
    pub version: u64,
}

pub trait TargetApi {
    fn create_page(&mut self, request: &CreatePageRequest<'_>) -> Result<TargetPage>;
    fn get_page(&mut self, page_id: &str) -> Result<TargetPage>;
    fn get_page_version(&mut self, page_id: &str) -> Result<u64> {
        Ok(self.get_page(page_id)?.version)
    }
    /// Writes `body` as the next version of the page.
    fn update_page(&mut self, page_id: &str, title: &str, body: &str) -> Result<TargetPage>;
    fn upload_attachment(
        &mut self,
        page_id: &str,
        filename: &str,
        content_type: &str,
        bytes: &[u8],
    ) -> Result<TargetAttachment>;
    fn set_attachment_content_type(
        &mut self,
        page_id: &str,
        attachment: &TargetAttachment,
        content_type: &str,
    ) -> Result<()>;
    fn request_count(&self) -> usize;
}

#[derive(Debug, Clone)]
pub struct ConfluenceClientConfig {
    pub base_url: String,
    pub space_key: String,
    pub email: String,
    pub api_token: String,
    pub http: HttpSettings,
}

impl ConfluenceClientConfig {
    pub fn from_config(config: &MigrateConfig) -> Result<Self> {
        let base_url = config
            .target_base_url()
            .ok_or_else(|| anyhow::anyhow!("target base url is not configured (CONFLUENCE_API)"))?;
        let space_key = config
            .target_space_key()
            .ok_or_else(|| anyhow::anyhow!("target space key is not configured (CONFLUENCE_SPACE)"))?;
        let email = config
            .target_email()
            .ok_or_else(|| anyhow::anyhow!("target email is not configured (CONFLUENCE_EMAIL)"))?;
        let api_token = secret("CONFLUENCE_API_KEY")
            .ok_or_else(|| anyhow::anyhow!("CONFLUENCE_API_KEY is not set"))?;
        Ok(Self {
            base_url,
            space_key,
            email,
            api_token,
            http: HttpSettings::from_config(config),
        })
    }
}

pub struct ConfluenceClient {
    client: Client,
    config: ConfluenceClientConfig,
    request_count: usize,
}

impl ConfluenceClient {
    pub fn new(config: ConfluenceClientConfig) -> Result<Self> {
        let client = config.http.build_client("target API")?;
        Ok(Self {
            client,
            config,
            request_count: 0,
        })
    }

    fn content_url(&self, suffix: &str) -> String {
        format!("{}/rest/api/content{}", self.config.base_url, suffix)
    }

    fn authorized(&mut self, builder: RequestBuilder) -> RequestBuilder {
        self.request_count += 1;
        builder
            .basic_auth(self.config.email.clone(), Some(self.config.api_token.clone()))
            .header("Accept", "application/json")
    }

    fn send_json(&mut self, builder: RequestBuilder, what: &str) -> Result<WireContent> {
        let response = self
            .authorized(builder)
            .send()
            .with_context(|| format!("failed to call target API ({what})"))?;
        ensure_success(response, "target API")?
            .json()
            .with_context(|| format!("failed to decode target API response ({what})"))
    }
}

impl TargetApi for ConfluenceClient {
    fn create_page(&mut self, request: &CreatePageRequest<'_>) -> Result<TargetPage> {
        let mut payload = json!({
            "type": "page",
            "title": request.title,
            "space": { "key": self.config.space_key },
            "body": { "storage": { "value": request.body, "representation": "storage" } },
        });
        if let Some(parent_id) = request.parent_id {
            payload["ancestors"] = json!([{ "id": parent_id }]);
        }
        tracing::debug!(
            title = request.title,
            position = request.position,
            total = request.total,
            "creating target page"
        );
        let builder = self.client.post(self.content_url("")).json(&payload);
        let content = self.send_json(builder, &format!("create page '{}'", request.title))?;
        Ok(content.into_page())
    }

    fn get_page(&mut self, page_id: &str) -> Result<TargetPage> {
        let builder = self
            .client
            .get(self.content_url(&format!("/{page_id}")))
            .query(&[("expand", "body.storage,version")]);
        let content = self.send_json(builder, &format!("get page {page_id}"))?;
        Ok(content.into_page())
    }

    fn get_page_version(&mut self, page_id: &str) -> Result<u64> {
        let builder = self
            .client
            .get(self.content_url(&format!("/{page_id}")))
            .query(&[("expand", "version")]);
        let content = self.send_json(builder, &format!("get version of page {page_id}"))?;
        Ok(content.version_number())
    }

    fn update_page(&mut self, page_id: &str, title: &str, body: &str) -> Result<TargetPage> {
        let current = self.get_page_version(page_id)?;
        let payload = json!({
            "id": page_id,
            "type": "page",
            "title": title,
            "body": { "storage": { "value": body, "representation": "storage" } },
            "version": { "number": current + 1 },
        });
        let builder = self
            .client
            .put(self.content_url(&format!("/{page_id}")))
            .json(&payload);
        let content = self.send_json(builder, &format!("update page {page_id}"))?;
        Ok(content.into_page())
    }

    fn upload_attachment(
        &mut self,
        page_id: &str,
        filename: &str,
        content_type: &str,
        bytes: &[u8],
    ) -> Result<TargetAttachment> {
        let part = Part::bytes(bytes.to_vec())
            .file_name(filename.to_string())
            .mime_str(content_type)
            .or_else(|_| {
                Part::bytes(bytes.to_vec())
                    .file_name(filename.to_string())
                    .mime_str("application/octet-stream")
            })
            .context("failed to build attachment upload part")?;
        let form = Form::new().part("file", part);
        let builder = self
            .client
            .post(self.content_url(&format!("/{page_id}/child/attachment")))
            .header("X-Atlassian-Token", "no-check")
            .multipart(form);
        let response = self
            .authorized(builder)
            .send()
            .with_context(|| format!("failed to upload '{filename}' to page {page_id}"))?;
        let listing: WireAttachmentListing = ensure_success(response, "target attachment upload")?
            .json()
            .context("failed to decode attachment upload response")?;
        let Some(first) = listing.results.into_iter().next() else {
            bail!("attachment upload of '{filename}' returned no results");
        };
        Ok(TargetAttachment {
            version: first.version_number(),
            id: first.id,
            title: first.title,
        })
    }

    fn set_attachment_content_type(
        &mut self,
        page_id: &str,
        attachment: &TargetAttachment,
        content_type: &str,
    ) -> Result<()> {
        let payload = json!({
            "id": attachment.id,
            "type": "attachment",
            "version": { "number": attachment.version + 1 },
            "metadata": { "mediaType": content_type },
        });
        let builder = self
            .client
            .put(self.content_url(&format!(
                "/{page_id}/child/attachment/{}",
                attachment.id
            )))
            .json(&payload);
        self.send_json(builder, &format!("set content type of {}", attachment.id))?;
        Ok(())
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

#[derive(Debug, Deserialize)]
struct WireContent {
    id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    version: Option<WireVersion>,
    #[serde(default)]
    body: Option<WireBody>,
}

#[derive(Debug, Deserialize)]
struct WireVersion {
    number: u64,
}

#[derive(Debug, Deserialize)]
struct WireBody {
    #[serde(default)]
    storage: Option<WireStorage>,
}

#[derive(Debug, Deserialize)]
struct WireStorage {
    #[serde(default)]
    value: String,
}

#[derive(Debug, Deserialize)]
struct WireAttachmentListing {
    #[serde(default)]
    results: Vec<WireContent>,
}

impl WireContent {
    fn version_number(&self) -> u64 {
        self.version.as_ref().map(|version| version.number).unwrap_or(1)
    }

    fn into_page(self) -> TargetPage {
        TargetPage {
            version: self.version_number(),
            body: self
                .body
                .and_then(|body| body.storage)
                .map(|storage| storage.value)
                .unwrap_or_default(),
            id: self.id,
            title: self.title,
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::{BTreeMap, BTreeSet};

    use super::*;

    pub(crate) struct MockTarget {
        pub pages: BTreeMap<String, TargetPage>,
        pub parents: BTreeMap<String, Option<String>>,
        pub created: Vec<String>,
        pub updates: Vec<String>,
        pub uploads: Vec<(String, String)>,
        pub content_type_updates: Vec<(String, String)>,
        pub failing_titles: BTreeSet<String>,
        pub failing_uploads: BTreeSet<String>,
        pub fail_content_type: bool,
        pub requests: usize,
        next_id: u64,
    }

    impl Default for MockTarget {
        fn default() -> Self {
            Self {
                pages: BTreeMap::new(),
                parents: BTreeMap::new(),
                created: Vec::new(),
                updates: Vec::new(),
                uploads: Vec::new(),
                content_type_updates: Vec::new(),
                failing_titles: BTreeSet::new(),
                failing_uploads: BTreeSet::new(),
                fail_content_type: false,
                requests: 0,
                next_id: 100,
            }
        }
    }

    impl MockTarget {
        pub fn with_page(mut self, id: &str, title: &str, version: u64, body: &str) -> Self {
            self.pages.insert(
                id.to_string(),
                TargetPage {
                    id: id.to_string(),
                    title: title.to_string(),
                    version,
                    body: body.to_string(),
                },
            );
            self
        }

        pub fn body(&self, id: &str) -> &str {
            self.pages
                .get(id)
                .map(|page| page.body.as_str())
                .unwrap_or_default()
        }
    }

    impl TargetApi for MockTarget {
        fn create_page(&mut self, request: &CreatePageRequest<'_>) -> Result<TargetPage> {
            self.requests += 1;
            if self.failing_titles.contains(request.title) {
                bail!("target API request failed with HTTP 400 Bad Request: error parsing xhtml");
            }
            self.next_id += 1;
            let page = TargetPage {
                id: self.next_id.to_string(),
                title: request.title.to_string(),
                version: 1,
                body: request.body.to_string(),
            };
            self.pages.insert(page.id.clone(), page.clone());
            self.parents
                .insert(page.id.clone(), request.parent_id.map(str::to_string));
            self.created.push(request.title.to_string());
            Ok(page)
        }

        fn get_page(&mut self, page_id: &str) -> Result<TargetPage> {
            self.requests += 1;
            self.pages
                .get(page_id)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("target API request failed with HTTP 404 Not Found"))
        }

        fn update_page(&mut self, page_id: &str, title: &str, body: &str) -> Result<TargetPage> {
            self.requests += 1;
            let Some(page) = self.pages.get_mut(page_id) else {
                bail!("target API request failed with HTTP 404 Not Found");
            };
            page.version += 1;
            page.title = title.to_string();
            page.body = body.to_string();
            self.updates.push(page_id.to_string());
            Ok(page.clone())
        }

        fn upload_attachment(
            &mut self,
            page_id: &str,
            filename: &str,
            _content_type: &str,
            _bytes: &[u8],
        ) -> Result<TargetAttachment> {
            self.requests += 1;
            if self.failing_uploads.contains(filename) {
                bail!("target attachment upload request failed with HTTP 413 Payload Too Large");
            }
            self.uploads.push((page_id.to_string(), filename.to_string()));
            Ok(TargetAttachment {
                id: format!("att{}", self.uploads.len()),
                title: filename.to_string(),
                version: 1,
            })
        }

        fn set_attachment_content_type(
            &mut self,
            _page_id: &str,
            attachment: &TargetAttachment,
            content_type: &str,
        ) -> Result<()> {
            self.requests += 1;
            if self.fail_content_type {
                bail!("target API request failed with HTTP 409 Conflict");
            }
            self.content_type_updates
                .push((attachment.id.clone(), content_type.to_string()));
            Ok(())
        }

        fn request_count(&self) -> usize {
            self.requests
        }
    }
}
