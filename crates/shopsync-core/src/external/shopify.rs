//! Shopify Admin REST adapter

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header::HeaderMap, Response};
use serde::{Deserialize, Serialize};

use super::{AuthContext, ExternalError, ExternalResourceClient};
use crate::models::{Price, ProductFields, ProductId, ProductRecord};

const ACCESS_TOKEN_HEADER: &str = "X-Shopify-Access-Token";
const KEY_TAG_PREFIX: &str = "shopsync-op-";
const PAGE_LIMIT: u32 = 250;

/// Products endpoint of the Shopify Admin REST API
#[derive(Debug, Clone)]
pub struct ShopifyRestClient {
    client: reqwest::Client,
    api_version: String,
    base_url: Option<String>,
}

impl ShopifyRestClient {
    /// Build a client. `base_url` overrides the default `https://{shop}`
    /// origin, e.g. for a local proxy.
    pub fn new(
        api_version: impl Into<String>,
        base_url: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ExternalError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| {
                ExternalError::permanent(format!("HTTP client setup failed: {}", sanitize(&error)))
            })?;
        Ok(Self {
            client,
            api_version: api_version.into(),
            base_url: base_url.map(|url| url.trim_end_matches('/').to_string()),
        })
    }

    fn origin(&self, ctx: &AuthContext) -> String {
        self.base_url
            .clone()
            .unwrap_or_else(|| format!("https://{}", ctx.shop.trim_end_matches('/')))
    }

    fn products_url(&self, ctx: &AuthContext, id: Option<&ProductId>) -> String {
        let origin = self.origin(ctx);
        match id {
            Some(id) => format!(
                "{origin}/admin/api/{}/products/{id}.json",
                self.api_version
            ),
            None => format!("{origin}/admin/api/{}/products.json", self.api_version),
        }
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        ctx: &AuthContext,
    ) -> Result<Response, ExternalError> {
        let response = request
            .header(ACCESS_TOKEN_HEADER, &ctx.access_token)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|error| transport_error(&error))?;

        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Err(ExternalError::from_status(
            status,
            format!("Shopify request failed with HTTP {status}: {}", compact_body(&body)),
        ))
    }

    /// Every product, following `Link` pagination
    async fn fetch_all(&self, ctx: &AuthContext) -> Result<Vec<ShopifyProduct>, ExternalError> {
        let mut products = Vec::new();
        let mut next_url = Some(format!(
            "{}?limit={PAGE_LIMIT}",
            self.products_url(ctx, None)
        ));

        while let Some(url) = next_url.take() {
            let response = self.send(self.client.get(&url), ctx).await?;
            next_url = next_page_url(response.headers());
            let page = response
                .json::<ProductListEnvelope>()
                .await
                .map_err(|error| decode_error(&error))?;
            products.extend(page.products);
        }
        Ok(products)
    }

    async fn decode_product(response: Response) -> Result<ProductRecord, ExternalError> {
        let envelope = response
            .json::<ProductEnvelope>()
            .await
            .map_err(|error| decode_error(&error))?;
        envelope.product.try_into()
    }
}

#[async_trait]
impl ExternalResourceClient for ShopifyRestClient {
    async fn create(
        &self,
        ctx: &AuthContext,
        idempotency_key: &str,
        fields: &ProductFields,
    ) -> Result<ProductRecord, ExternalError> {
        let request = self
            .client
            .post(self.products_url(ctx, None))
            .json(&ProductWrite::for_create(fields, idempotency_key));
        let response = self.send(request, ctx).await?;
        Self::decode_product(response).await
    }

    async fn find_created(
        &self,
        ctx: &AuthContext,
        idempotency_key: &str,
    ) -> Result<Option<ProductRecord>, ExternalError> {
        let tag = key_tag(idempotency_key);
        let found = self
            .fetch_all(ctx)
            .await?
            .into_iter()
            .find(|product| has_tag(product.tags.as_deref(), &tag));
        found.map(ProductRecord::try_from).transpose()
    }

    async fn update(
        &self,
        ctx: &AuthContext,
        id: &ProductId,
        fields: &ProductFields,
    ) -> Result<ProductRecord, ExternalError> {
        let request = self
            .client
            .put(self.products_url(ctx, Some(id)))
            .json(&ProductWrite::from(fields));
        let response = self.send(request, ctx).await?;
        Self::decode_product(response).await
    }

    async fn delete(&self, ctx: &AuthContext, id: &ProductId) -> Result<(), ExternalError> {
        let request = self.client.delete(self.products_url(ctx, Some(id)));
        self.send(request, ctx).await?;
        Ok(())
    }

    async fn get(&self, ctx: &AuthContext, id: &ProductId) -> Result<ProductRecord, ExternalError> {
        let request = self.client.get(self.products_url(ctx, Some(id)));
        let response = self.send(request, ctx).await?;
        Self::decode_product(response).await
    }

    async fn list(&self, ctx: &AuthContext) -> Result<Vec<ProductRecord>, ExternalError> {
        let products = self
            .fetch_all(ctx)
            .await?
            .into_iter()
            .map(ProductRecord::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        tracing::debug!(count = products.len(), "Listed external products");
        Ok(products)
    }
}

#[derive(Debug, Serialize)]
struct ProductWrite {
    product: ProductWriteBody,
}

#[derive(Debug, Serialize)]
struct ProductWriteBody {
    title: String,
    body_html: String,
    vendor: String,
    variants: Vec<VariantWrite>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tags: Option<String>,
}

#[derive(Debug, Serialize)]
struct VariantWrite {
    price: String,
}

impl From<&ProductFields> for ProductWrite {
    fn from(fields: &ProductFields) -> Self {
        Self {
            product: ProductWriteBody {
                title: fields.title.clone(),
                body_html: fields.description.clone(),
                vendor: fields.vendor.clone(),
                variants: vec![VariantWrite {
                    price: fields.price.to_string(),
                }],
                tags: None,
            },
        }
    }
}

impl ProductWrite {
    /// Create body stamped with the tag derived from `idempotency_key`
    fn for_create(fields: &ProductFields, idempotency_key: &str) -> Self {
        let mut write = Self::from(fields);
        write.product.tags = Some(key_tag(idempotency_key));
        write
    }
}

/// Product tag that records which idempotency key created the product.
///
/// Shopify does not deduplicate `POST products.json`, so the key is kept on
/// the product itself. Tags are capped at 255 characters and split on
/// commas, so the key is folded into a name-based UUID first.
fn key_tag(idempotency_key: &str) -> String {
    let id = uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_OID, idempotency_key.as_bytes());
    format!("{KEY_TAG_PREFIX}{id}")
}

fn has_tag(tags: Option<&str>, tag: &str) -> bool {
    tags.is_some_and(|tags| tags.split(',').any(|candidate| candidate.trim() == tag))
}

#[derive(Debug, Deserialize)]
struct ProductEnvelope {
    product: ShopifyProduct,
}

#[derive(Debug, Deserialize)]
struct ProductListEnvelope {
    products: Vec<ShopifyProduct>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawId {
    Number(u64),
    Text(String),
}

#[derive(Debug, Deserialize)]
struct ShopifyProduct {
    id: RawId,
    title: String,
    body_html: Option<String>,
    vendor: Option<String>,
    updated_at: Option<String>,
    #[serde(default)]
    variants: Vec<ShopifyVariant>,
    tags: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ShopifyVariant {
    price: Price,
}

impl TryFrom<ShopifyProduct> for ProductRecord {
    type Error = ExternalError;

    fn try_from(product: ShopifyProduct) -> Result<Self, Self::Error> {
        let id = match product.id {
            RawId::Number(id) => id.to_string(),
            RawId::Text(id) => id,
        };
        if id.trim().is_empty() {
            return Err(ExternalError::permanent("Shopify product has an empty id"));
        }
        let price = product
            .variants
            .first()
            .map(|variant| variant.price)
            .unwrap_or_default();

        Ok(Self {
            id: ProductId::new(id),
            title: product.title,
            description: product.body_html.unwrap_or_default(),
            price,
            vendor: product.vendor.unwrap_or_default(),
            external_version: product.updated_at,
        })
    }
}

/// Extract the `rel="next"` target from a Shopify `Link` header
fn next_page_url(headers: &HeaderMap) -> Option<String> {
    let link = headers.get(reqwest::header::LINK)?.to_str().ok()?;
    link.split(',').find_map(|part| {
        let (target, params) = part.split_once(';')?;
        if !params.contains("rel=\"next\"") {
            return None;
        }
        let target = target.trim();
        target
            .strip_prefix('<')
            .and_then(|rest| rest.strip_suffix('>'))
            .map(str::to_string)
    })
}

fn transport_error(error: &reqwest::Error) -> ExternalError {
    if error.is_builder() {
        ExternalError::permanent(format!("Shopify request invalid: {}", sanitize(error)))
    } else {
        ExternalError::transient(format!("Shopify request failed: {}", sanitize(error)))
    }
}

fn decode_error(error: &reqwest::Error) -> ExternalError {
    ExternalError::permanent(format!("Shopify response parse failed: {}", sanitize(error)))
}

fn sanitize(error: &impl std::fmt::Display) -> String {
    error.to_string().replace('\n', " ").trim().to_string()
}

fn compact_body(body: &str) -> String {
    body.trim().chars().take(180).collect()
}
