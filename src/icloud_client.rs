use std::{collections::HashMap, future::Future};

use async_trait::async_trait;
use log::{debug, info, warn};
use reqwest::{
    Client, Response, StatusCode,
    header::{self, HeaderMap, HeaderValue},
};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::{
    config::ICloudConfig,
    error::ClientError,
    library::PhotoLibrary,
    model::{Asset, ModifyResponse, Page, QueryResponse},
    prompt::Prompt,
};

const USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.0 Safari/605.1.15";
const AUTH_ENDPOINT: &str = "https://idmsa.apple.com/appleauth/auth";
const SETUP_ENDPOINT: &str = "https://setup.icloud.com/setup/ws/1";
const HOME_ENDPOINT: &str = "https://www.icloud.com";
const WIDGET_KEY: &str = "d39ba9916b7251055b22c7f910e2ea796ee65e98b2ddecea8f5dde8d9d1a815d";
const CLIENT_BUILD: &str = "17DHotfix5";

const PHOTOS_DATABASE: &str = "database/1/com.apple.photos.cloud/production/private";
const PHOTOS_ZONE: &str = "PrimarySync";
const ASSET_QUERY: &str = "CPLAssetAndMasterByAssetDateWithoutHiddenOrDeleted";
const DESIRED_KEYS: &[&str] = &[
    "resOriginalRes",
    "resOriginalFileType",
    "filenameEnc",
    "masterRef",
    "assetDate",
    "addedDate",
    "isDeleted",
    "recordName",
    "recordType",
    "recordChangeTag",
];

const SESSION_TOKEN_HEADER: &str = "x-apple-session-token";
const SESSION_ID_HEADER: &str = "x-apple-id-session-id";
const SCNT_HEADER: &str = "scnt";
const ACCOUNT_COUNTRY_HEADER: &str = "x-apple-id-account-country";
const TRUST_TOKEN_HEADER: &str = "x-apple-twosv-trust-token";

pub struct ICloudClient {
    username: String,
    password: String,
    page_size: usize,
    client_id: String,
    client: Client,
    session: AuthSession,
    dsid: Option<String>,
    photos: Option<PhotosSession>,
}

/// Headers handed out by the auth service and echoed back on later calls.
#[derive(Debug, Default)]
struct AuthSession {
    session_token: Option<String>,
    session_id: Option<String>,
    scnt: Option<String>,
    account_country: Option<String>,
    trust_token: Option<String>,
}

impl AuthSession {
    fn update(&mut self, headers: &HeaderMap) {
        let read = |name: &str| {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        };
        for (name, slot) in [
            (SESSION_TOKEN_HEADER, &mut self.session_token),
            (SESSION_ID_HEADER, &mut self.session_id),
            (SCNT_HEADER, &mut self.scnt),
            (ACCOUNT_COUNTRY_HEADER, &mut self.account_country),
            (TRUST_TOKEN_HEADER, &mut self.trust_token),
        ] {
            if let Some(value) = read(name) {
                *slot = Some(value);
            }
        }
    }
}

struct PhotosSession {
    database_url: String,
}

#[derive(Deserialize)]
struct AccountLogin {
    #[serde(rename = "dsInfo")]
    ds_info: DsInfo,
    #[serde(default)]
    webservices: HashMap<String, Webservice>,
    #[serde(rename = "hsaChallengeRequired", default)]
    hsa_challenge_required: bool,
    #[serde(rename = "hsaTrustedBrowser", default)]
    hsa_trusted_browser: bool,
}

#[derive(Deserialize)]
struct DsInfo {
    dsid: Value,
    #[serde(rename = "hsaVersion", default)]
    hsa_version: u8,
}

#[derive(Deserialize)]
struct Webservice {
    url: String,
}

#[derive(Deserialize)]
struct TrustedDevices {
    #[serde(default)]
    devices: Vec<Value>,
}

#[derive(Debug, PartialEq)]
enum SecondFactor {
    NotRequired,
    TwoFactor,
    TwoStep,
}

impl AccountLogin {
    fn second_factor(&self) -> SecondFactor {
        let challenged = self.hsa_challenge_required || !self.hsa_trusted_browser;
        match self.ds_info.hsa_version {
            2 if challenged => SecondFactor::TwoFactor,
            1 if challenged => SecondFactor::TwoStep,
            _ => SecondFactor::NotRequired,
        }
    }

    fn dsid(&self) -> String {
        match &self.ds_info.dsid {
            Value::String(dsid) => dsid.clone(),
            other => other.to_string(),
        }
    }
}

impl ICloudClient {
    pub fn new(config: &ICloudConfig) -> Result<ICloudClient, ClientError> {
        Ok(ICloudClient {
            username: config.username.clone(),
            password: config.password.clone(),
            page_size: config.page_size,
            client_id: client_id(),
            client: Self::build_client()?,
            session: AuthSession::default(),
            dsid: None,
            photos: None,
        })
    }

    fn build_client() -> Result<Client, ClientError> {
        let mut headers = HeaderMap::new();
        headers.insert(header::USER_AGENT, HeaderValue::from_static(USER_AGENT));
        headers.insert(header::ORIGIN, HeaderValue::from_static(HOME_ENDPOINT));
        headers.insert(
            header::REFERER,
            HeaderValue::from_static("https://www.icloud.com/"),
        );

        Ok(Client::builder()
            .default_headers(headers)
            .cookie_store(true)
            .build()?)
    }

    fn rebuild_client(&mut self) -> Result<(), ClientError> {
        self.client = Self::build_client()?;
        self.session = AuthSession::default();
        self.dsid = None;
        self.photos = None;
        Ok(())
    }

    /// Signs in, walks through two-factor or two-step verification when the
    /// account asks for it, and locates the photos database.
    pub async fn login<P: Prompt>(&mut self, prompt: &mut P) -> Result<(), ClientError> {
        self.rebuild_client()?;
        self.sign_in().await?;

        let mut account = self.account_login().await?;
        // The verification endpoints expect the dsid from the first login.
        self.remember_account(&account);
        match account.second_factor() {
            SecondFactor::NotRequired => {}
            SecondFactor::TwoFactor => {
                self.verify_two_factor(prompt).await?;
                account = self.account_login().await?;
                self.remember_account(&account);
            }
            SecondFactor::TwoStep => {
                self.verify_two_step(prompt).await?;
                account = self.account_login().await?;
                self.remember_account(&account);
            }
        }
        if account.second_factor() != SecondFactor::NotRequired {
            warn!("iCloud still reports this session as untrusted, continuing anyway.");
        }

        let database_url = match account.webservices.get("ckdatabasews") {
            Some(service) => service.url.trim_end_matches('/').to_string(),
            None => {
                return Err(ClientError::UnexpectedResponse(
                    "iCloud Photos is not available for this account".to_string(),
                ));
            }
        };
        self.photos = Some(PhotosSession { database_url });

        self.check_indexing().await?;
        info!("Logged in to iCloud as {}", self.username);
        Ok(())
    }

    fn remember_account(&mut self, account: &AccountLogin) {
        self.dsid = Some(account.dsid());
    }

    async fn sign_in(&mut self) -> Result<(), ClientError> {
        let trust_tokens: Vec<&str> = self.session.trust_token.as_deref().into_iter().collect();
        let response = self
            .client
            .post(format!("{AUTH_ENDPOINT}/signin"))
            .query(&[("isRememberMeEnabled", "true")])
            .headers(self.auth_headers())
            .json(&json!({
                "accountName": self.username,
                "password": self.password,
                "rememberMe": true,
                "trustTokens": trust_tokens,
            }))
            .send()
            .await?;
        self.session.update(response.headers());
        sign_in_status(response.status())?;

        if self.session.session_token.is_none() {
            return Err(ClientError::Auth(
                "sign-in response carried no session token".to_string(),
            ));
        }
        debug!("Signed in, session id {:?}", self.session.session_id);
        Ok(())
    }

    async fn account_login(&self) -> Result<AccountLogin, ClientError> {
        let response = self
            .client
            .post(format!("{SETUP_ENDPOINT}/accountLogin"))
            .query(&self.client_params())
            .json(&json!({
                "accountCountryCode": self.session.account_country.clone().unwrap_or_default(),
                "dsWebAuthToken": self.session.session_token.clone().unwrap_or_default(),
                "extended_login": true,
                "trustToken": self.session.trust_token.clone().unwrap_or_default(),
            }))
            .send()
            .await?;

        Ok(check(response)?.json().await?)
    }

    async fn verify_two_factor<P: Prompt>(&mut self, prompt: &mut P) -> Result<(), ClientError> {
        println!("Two-factor authentication required. A code has been sent to your devices.");
        let code = prompt.ask("Enter the 2FA code: ")?;

        let response = self
            .client
            .post(format!("{AUTH_ENDPOINT}/verify/trusteddevice/securitycode"))
            .headers(self.auth_headers())
            .json(&json!({ "securityCode": { "code": code } }))
            .send()
            .await?;
        self.session.update(response.headers());
        if !response.status().is_success() {
            return Err(ClientError::Auth("Failed to verify the 2FA code.".to_string()));
        }

        let trust = self
            .client
            .get(format!("{AUTH_ENDPOINT}/2sv/trust"))
            .headers(self.auth_headers())
            .send()
            .await?;
        self.session.update(trust.headers());
        check(trust)?;
        Ok(())
    }

    async fn verify_two_step<P: Prompt>(&mut self, prompt: &mut P) -> Result<(), ClientError> {
        println!("Two-step authentication required. A code has been sent to your trusted devices.");
        let response = self
            .client
            .get(format!("{SETUP_ENDPOINT}/listDevices"))
            .query(&self.client_params())
            .send()
            .await?;
        let devices: TrustedDevices = check(response)?.json().await?;
        let mut device = devices
            .devices
            .into_iter()
            .next()
            .ok_or_else(|| ClientError::Auth("no trusted devices on the account".to_string()))?;
        info!("Sending verification code to {}", describe_device(&device));

        let response = self
            .client
            .post(format!("{SETUP_ENDPOINT}/sendVerificationCode"))
            .query(&self.client_params())
            .json(&device)
            .send()
            .await?;
        let sent: Value = check(response)?.json().await?;
        if !sent["success"].as_bool().unwrap_or(false) {
            return Err(ClientError::Auth(
                "could not send a verification code".to_string(),
            ));
        }

        let code = prompt.ask("Enter the 2SA code: ")?;
        if let Value::Object(fields) = &mut device {
            fields.insert("verificationCode".to_string(), Value::String(code));
            fields.insert("trustBrowser".to_string(), Value::Bool(true));
        }
        let response = self
            .client
            .post(format!("{SETUP_ENDPOINT}/validateVerificationCode"))
            .query(&self.client_params())
            .json(&device)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ClientError::Auth("Failed to verify the 2SA code.".to_string()));
        }
        Ok(())
    }

    async fn check_indexing(&self) -> Result<(), ClientError> {
        let response = self
            .query(&json!({
                "query": { "recordType": "CheckIndexingState" },
                "zoneID": { "zoneName": PHOTOS_ZONE },
            }))
            .await?;
        indexing_state(&response)
    }

    fn auth_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert("x-apple-oauth-client-id", HeaderValue::from_static(WIDGET_KEY));
        headers.insert(
            "x-apple-oauth-client-type",
            HeaderValue::from_static("firstPartyAuth"),
        );
        headers.insert(
            "x-apple-oauth-redirect-uri",
            HeaderValue::from_static(HOME_ENDPOINT),
        );
        headers.insert("x-apple-oauth-require-grant-code", HeaderValue::from_static("true"));
        headers.insert("x-apple-oauth-response-mode", HeaderValue::from_static("web_message"));
        headers.insert("x-apple-oauth-response-type", HeaderValue::from_static("code"));
        headers.insert("x-apple-widget-key", HeaderValue::from_static(WIDGET_KEY));

        for (name, value) in [
            ("x-apple-oauth-state", Some(&self.client_id)),
            (SESSION_ID_HEADER, self.session.session_id.as_ref()),
            (SCNT_HEADER, self.session.scnt.as_ref()),
        ] {
            if let Some(value) = value.and_then(|v| HeaderValue::from_str(v).ok()) {
                headers.insert(name, value);
            }
        }
        headers
    }

    fn client_params(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("clientBuildNumber", CLIENT_BUILD.to_string()),
            ("clientMountVersion", CLIENT_BUILD.to_string()),
            ("clientId", self.client_id.clone()),
        ];
        if let Some(dsid) = &self.dsid {
            params.push(("dsid", dsid.clone()));
        }
        params
    }

    fn photos(&self) -> Result<&PhotosSession, ClientError> {
        self.photos
            .as_ref()
            .ok_or_else(|| ClientError::Auth("not logged in".to_string()))
    }

    async fn post_database<T: serde::de::DeserializeOwned>(
        &self,
        operation: &str,
        body: &Value,
    ) -> Result<T, ClientError> {
        let photos = self.photos()?;
        let response = self
            .client
            .post(format!("{}/{PHOTOS_DATABASE}/records/{operation}", photos.database_url))
            .query(&self.client_params())
            .query(&[("remapEnums", "true"), ("getCurrentSyncToken", "true")])
            .header(header::CONTENT_TYPE, "text/plain")
            .body(body.to_string())
            .send()
            .await?;

        Ok(check(response)?.json().await?)
    }

    async fn query(&self, body: &Value) -> Result<QueryResponse, ClientError> {
        self.post_database("query", body).await
    }
}

#[async_trait]
impl PhotoLibrary for ICloudClient {
    async fn assets(&self) -> Result<Vec<Asset>, ClientError> {
        let assets = collect_pages(|offset| async move {
            self.query(&asset_query(offset, self.page_size)).await
        })
        .await?;

        info!("Found {} photos in the library", assets.len());
        Ok(assets)
    }

    async fn download(
        &self,
        asset: &Asset,
        dest: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<u64, ClientError> {
        // Download URLs are pre-signed, so a 403 here is an expired link and not a lost session.
        let mut response = self.client.get(&asset.download_url).send().await?;
        content_status(response.status())?;

        let mut written = 0;
        while let Some(chunk) = response.chunk().await? {
            dest.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        dest.flush().await?;
        Ok(written)
    }

    async fn delete(&self, asset: &Asset) -> Result<(), ClientError> {
        let response: ModifyResponse = self.post_database("modify", &delete_body(asset)).await?;
        match response.first_error() {
            Some(error) => Err(ClientError::UnexpectedResponse(error)),
            None => Ok(()),
        }
    }
}

fn check(response: Response) -> Result<Response, ClientError> {
    api_status(response.status(), response.url().path())?;
    Ok(response)
}

/// 401 and 403 from the iCloud API mean the session is no longer valid.
fn api_status(status: StatusCode, path: &str) -> Result<(), ClientError> {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Err(ClientError::Auth(format!("{path} returned {status}")))
        }
        status if !status.is_success() => Err(ClientError::UnexpectedResponse(format!(
            "{path} returned {status}"
        ))),
        _ => Ok(()),
    }
}

/// Download URLs are pre-signed, so a 403 is an expired link and not a lost session.
fn content_status(status: StatusCode) -> Result<(), ClientError> {
    if status.is_success() {
        Ok(())
    } else {
        Err(ClientError::UnexpectedResponse(format!(
            "download link returned {status}"
        )))
    }
}

/// 409 means the password was accepted and a second factor is pending.
fn sign_in_status(status: StatusCode) -> Result<(), ClientError> {
    match status {
        StatusCode::OK | StatusCode::CONFLICT => Ok(()),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Err(ClientError::Auth("invalid username or password".to_string()))
        }
        status => Err(ClientError::Auth(format!(
            "sign-in refused with status {status}"
        ))),
    }
}

fn indexing_state(response: &QueryResponse) -> Result<(), ClientError> {
    let state = response
        .records
        .first()
        .and_then(|record| record.fields.state.as_ref())
        .map(|state| state.value.as_str());
    if state != Some("FINISHED") {
        return Err(ClientError::UnexpectedResponse(
            "iCloud Photo Library not finished indexing. Please try again in a few minutes."
                .to_string(),
        ));
    }
    Ok(())
}

/// Fetches pages by `startRank` offset until one comes back without asset records.
async fn collect_pages<F, Fut>(mut fetch: F) -> Result<Vec<Asset>, ClientError>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<QueryResponse, ClientError>>,
{
    let mut assets: Vec<Asset> = Vec::new();
    let mut offset = 0;
    loop {
        let page = Page::from_records(fetch(offset).await?.records);
        if page.asset_records == 0 {
            break;
        }
        offset += page.asset_records;
        debug!("Listed {offset} asset records so far");
        assets.extend(page.assets);
    }
    Ok(assets)
}

fn asset_query(offset: usize, page_size: usize) -> Value {
    json!({
        "query": {
            "filterBy": [
                {
                    "fieldName": "startRank",
                    "fieldValue": { "type": "INT64", "value": offset },
                    "comparator": "EQUALS",
                },
                {
                    "fieldName": "direction",
                    "fieldValue": { "type": "STRING", "value": "ASCENDING" },
                    "comparator": "EQUALS",
                },
            ],
            "recordType": ASSET_QUERY,
        },
        // Every asset comes back together with its master record.
        "resultsLimit": page_size * 2,
        "desiredKeys": DESIRED_KEYS,
        "zoneID": { "zoneName": PHOTOS_ZONE },
    })
}

fn delete_body(asset: &Asset) -> Value {
    json!({
        "operations": [
            {
                "operationType": "update",
                "record": {
                    "recordName": asset.id,
                    "recordType": asset.record_type,
                    "recordChangeTag": asset.change_tag,
                    "fields": { "isDeleted": { "value": 1 } },
                },
            },
        ],
        "zoneID": { "zoneName": PHOTOS_ZONE },
        "atomic": true,
    })
}

fn describe_device(device: &Value) -> String {
    if let Some(name) = device["deviceName"].as_str() {
        return name.to_string();
    }
    match device["phoneNumber"].as_str() {
        Some(phone) => format!("SMS to {phone}"),
        None => "the first trusted device".to_string(),
    }
}

fn client_id() -> String {
    let bytes: [u8; 16] = rand::random();
    let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
    format!(
        "auth-{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

#[cfg(test)]
mod tests {
    use reqwest::header::{HeaderMap, HeaderValue};
    use rstest::rstest;
    use serde_json::json;

    use std::sync::Mutex;

    use reqwest::StatusCode;

    use super::{
        AccountLogin, AuthSession, ICloudClient, SecondFactor, api_status, asset_query, client_id,
        collect_pages, content_status, delete_body, describe_device, indexing_state,
        sign_in_status,
    };
    use crate::{
        config::ICloudConfig,
        error::ClientError,
        library::fake::asset,
        model::QueryResponse,
    };

    fn account(hsa_version: u8, challenge: bool, trusted: bool) -> AccountLogin {
        let json = json!({
            "dsInfo": { "dsid": "1234567890", "hsaVersion": hsa_version },
            "webservices": {
                "ckdatabasews": { "url": "https://p42-ckdatabasews.icloud.com:443", "status": "active" }
            },
            "hsaChallengeRequired": challenge,
            "hsaTrustedBrowser": trusted,
        });
        serde_json::from_value(json).unwrap()
    }

    #[rstest]
    #[case(2, true, false, SecondFactor::TwoFactor)]
    #[case(2, false, false, SecondFactor::TwoFactor)]
    #[case(2, false, true, SecondFactor::NotRequired)]
    #[case(1, true, true, SecondFactor::TwoStep)]
    #[case(0, true, false, SecondFactor::NotRequired)]
    fn second_factor_detection(
        #[case] hsa_version: u8,
        #[case] challenge: bool,
        #[case] trusted: bool,
        #[case] expected: SecondFactor,
    ) {
        assert_eq!(account(hsa_version, challenge, trusted).second_factor(), expected);
    }

    #[test]
    fn account_login_exposes_photos_service() {
        let account = account(2, false, true);
        assert_eq!(account.dsid(), "1234567890");
        assert_eq!(
            account.webservices["ckdatabasews"].url,
            "https://p42-ckdatabasews.icloud.com:443"
        );
    }

    #[test]
    fn numeric_dsid() {
        let account: AccountLogin =
            serde_json::from_value(json!({ "dsInfo": { "dsid": 42 } })).unwrap();
        assert_eq!(account.dsid(), "42");
        assert_eq!(account.second_factor(), SecondFactor::NotRequired);
    }

    #[test]
    fn session_keeps_known_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("x-apple-session-token", HeaderValue::from_static("token-1"));
        headers.insert("scnt", HeaderValue::from_static("scnt-1"));
        headers.insert("x-apple-id-account-country", HeaderValue::from_static("GBR"));

        let mut session = AuthSession::default();
        session.update(&headers);

        let mut later = HeaderMap::new();
        later.insert("x-apple-session-token", HeaderValue::from_static("token-2"));
        session.update(&later);

        assert_eq!(session.session_token.as_deref(), Some("token-2"));
        assert_eq!(session.scnt.as_deref(), Some("scnt-1"));
        assert_eq!(session.account_country.as_deref(), Some("GBR"));
        assert!(session.trust_token.is_none());
    }

    #[test]
    fn asset_query_pages_by_rank() {
        let body = asset_query(200, 100);
        assert_eq!(body["query"]["filterBy"][0]["fieldValue"]["value"], 200);
        assert_eq!(body["query"]["filterBy"][1]["fieldValue"]["value"], "ASCENDING");
        assert_eq!(
            body["query"]["recordType"],
            "CPLAssetAndMasterByAssetDateWithoutHiddenOrDeleted"
        );
        assert_eq!(body["resultsLimit"], 200);
        assert_eq!(body["zoneID"]["zoneName"], "PrimarySync");
    }

    #[test]
    fn delete_marks_asset_record_deleted() {
        let asset = asset("ASSET-1", "IMG_0001.JPG", None);
        let body = delete_body(&asset);
        let record = &body["operations"][0]["record"];
        assert_eq!(body["operations"][0]["operationType"], "update");
        assert_eq!(record["recordName"], "ASSET-1");
        assert_eq!(record["recordType"], "CPLAsset");
        assert_eq!(record["recordChangeTag"], "tag");
        assert_eq!(record["fields"]["isDeleted"]["value"], 1);
    }

    #[test]
    fn device_description() {
        assert_eq!(describe_device(&json!({ "deviceName": "iPhone" })), "iPhone");
        assert_eq!(
            describe_device(&json!({ "phoneNumber": "********42" })),
            "SMS to ********42"
        );
    }

    #[test]
    fn client_id_looks_like_uuid() {
        let id = client_id();
        assert!(id.starts_with("auth-"));
        assert_eq!(id.len(), "auth-".len() + 36);
        assert_eq!(id.matches('-').count(), 5);
    }

    #[test]
    fn dsid_is_sent_before_second_factor() {
        let config = ICloudConfig {
            username: "someone@example.com".to_string(),
            password: "pw".to_string(),
            page_size: 10,
        };
        let mut client = ICloudClient::new(&config).unwrap();
        assert!(client.client_params().iter().all(|(name, _)| *name != "dsid"));

        client.remember_account(&account(1, true, false));

        assert!(client.photos.is_none());
        assert!(
            client
                .client_params()
                .contains(&("dsid", "1234567890".to_string()))
        );
    }

    #[rstest]
    #[case(StatusCode::UNAUTHORIZED, true)]
    #[case(StatusCode::FORBIDDEN, true)]
    #[case(StatusCode::INTERNAL_SERVER_ERROR, false)]
    #[case(StatusCode::NOT_FOUND, false)]
    fn api_errors(#[case] status: StatusCode, #[case] fatal: bool) {
        let err = api_status(status, "/records/query").unwrap_err();
        assert_eq!(err.is_fatal(), fatal);
        assert!(err.to_string().contains("/records/query"));
    }

    #[test]
    fn api_success() {
        assert!(api_status(StatusCode::OK, "/accountLogin").is_ok());
    }

    #[rstest]
    #[case(StatusCode::FORBIDDEN)]
    #[case(StatusCode::UNAUTHORIZED)]
    #[case(StatusCode::GONE)]
    fn content_errors_are_per_item(#[case] status: StatusCode) {
        let err = content_status(status).unwrap_err();
        assert!(!err.is_fatal());
        assert!(content_status(StatusCode::OK).is_ok());
    }

    #[rstest]
    #[case(StatusCode::OK, true)]
    #[case(StatusCode::CONFLICT, true)]
    #[case(StatusCode::UNAUTHORIZED, false)]
    #[case(StatusCode::FORBIDDEN, false)]
    #[case(StatusCode::SERVICE_UNAVAILABLE, false)]
    fn sign_in_statuses(#[case] status: StatusCode, #[case] accepted: bool) {
        match sign_in_status(status) {
            Ok(()) => assert!(accepted),
            Err(err) => {
                assert!(!accepted);
                assert!(err.is_fatal());
            }
        }
    }

    fn state_response(state: Option<&str>) -> QueryResponse {
        let records = match state {
            Some(state) => json!([{
                "recordName": "_5a0b8c6f",
                "recordType": "CheckIndexingState",
                "fields": { "state": { "value": state, "type": "STRING" } },
            }]),
            None => json!([]),
        };
        serde_json::from_value(json!({ "records": records })).unwrap()
    }

    #[test]
    fn indexing_must_be_finished() {
        assert!(indexing_state(&state_response(Some("FINISHED"))).is_ok());
        assert!(indexing_state(&state_response(Some("RUNNING"))).is_err());
        assert!(indexing_state(&state_response(None)).is_err());
    }

    /// One page of `count` asset/master pairs starting at `first`.
    fn page(first: usize, count: usize) -> QueryResponse {
        let mut records = Vec::new();
        for n in first..first + count {
            records.push(json!({
                "recordName": format!("M{n}"),
                "recordType": "CPLMaster",
                "fields": { "resOriginalRes": { "value": { "downloadURL": format!("https://example/{n}") } } },
            }));
            records.push(json!({
                "recordName": format!("A{n}"),
                "recordType": "CPLAsset",
                "fields": {
                    "masterRef": { "value": { "recordName": format!("M{n}") } },
                    "assetDate": { "value": 1_600_000_000_000i64 },
                },
            }));
        }
        serde_json::from_value(json!({ "records": records })).unwrap()
    }

    #[tokio::test]
    async fn listing_advances_by_asset_records_and_stops_on_empty_page() {
        let offsets = Mutex::new(Vec::new());
        let assets = collect_pages(|offset| {
            offsets.lock().unwrap().push(offset);
            let response = match offset {
                0 => page(0, 3),
                3 => page(3, 2),
                _ => page(0, 0),
            };
            async move { Ok(response) }
        })
        .await
        .unwrap();

        assert_eq!(*offsets.lock().unwrap(), vec![0, 3, 5]);
        let ids: Vec<&str> = assets.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["A0", "A1", "A2", "A3", "A4"]);
    }

    #[tokio::test]
    async fn listing_error_stops_enumeration() {
        let result = collect_pages(|offset| async move {
            if offset == 0 {
                Ok(page(0, 2))
            } else {
                Err(ClientError::Auth("session expired".to_string()))
            }
        })
        .await;

        assert!(result.unwrap_err().is_fatal());
    }
}
