//! Blocking HTTP client for the ledger API.

use std::path::Path;
use std::time::Duration;

use reqwest::blocking::multipart::Form;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::Url;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use super::{
    Branch, BranchArtifacts, CreateBranch, FinalizeRequest, ParamsReceipt, ProofAddresses,
    ProofFiles, PushStep, Remote, RemoteCommit, RemoteError, RepositoryInfo, Session,
};
use crate::config::Config;
use crate::proof::ProofBundle;
use crate::repo::commit::{CommitHash, Parent};

pub struct HttpRemote {
    client: Client,
    base_url: Url,
    token: Option<String>,
    repo: String,
}

impl std::fmt::Debug for HttpRemote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpRemote")
            .field("base_url", &self.base_url.as_str())
            .field("repo", &self.repo)
            .finish()
    }
}

impl HttpRemote {
    /// Client for repository `repo` on the ledger configured in `config`.
    pub fn new(config: &Config, repo: impl Into<String>) -> Result<Self, RemoteError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(config.request_timeout())
            .build()?;
        let base_url = Url::parse(&config.api_base_url)
            .map_err(|e| RemoteError::Decode(format!("invalid api base url: {e}")))?;
        Ok(HttpRemote {
            client,
            base_url,
            token: config.auth_token.clone(),
            repo: repo.into(),
        })
    }

    fn url(&self, segments: &[&str]) -> Result<Url, RemoteError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| RemoteError::Decode("api base url cannot carry a path".into()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn branch_url(&self, tail: &[&str]) -> Result<Url, RemoteError> {
        let mut segments = vec!["repo", "hash", self.repo.as_str(), "branch"];
        segments.extend_from_slice(tail);
        self.url(&segments)
    }

    fn step_url(&self, branch_hash: &str, step: PushStep) -> Result<Url, RemoteError> {
        self.url(&[
            "repos",
            &self.repo,
            "branches",
            branch_hash,
            "commits",
            "create",
            step.endpoint(),
        ])
    }

    fn authorized(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    fn get<T: DeserializeOwned>(&self, url: Url) -> Result<T, RemoteError> {
        debug!(%url, "GET");
        let response = self.authorized(self.client.get(url)).send()?;
        parse(response)
    }

    fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        url: Url,
        body: &B,
    ) -> Result<T, RemoteError> {
        debug!(%url, "POST");
        let response = self.authorized(self.client.post(url).json(body)).send()?;
        parse(response)
    }

    fn post_form(&self, url: Url, form: Form) -> Result<Value, RemoteError> {
        debug!(%url, "POST multipart");
        let response = self.authorized(self.client.post(url).multipart(form)).send()?;
        parse(response)
    }

    fn get_bytes(&self, url: Url) -> Result<Option<Vec<u8>>, RemoteError> {
        debug!(%url, "GET bytes");
        let response = self.authorized(self.client.get(url)).send()?;
        if response.status().as_u16() == 404 {
            return Ok(None);
        }
        let response = check_status(response)?;
        Ok(Some(response.bytes()?.to_vec()))
    }
}

fn check_status(response: Response) -> Result<Response, RemoteError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().unwrap_or_default();
    let message = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|v| {
            v.pointer("/error/message")
                .or_else(|| v.get("message"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or(body);
    Err(RemoteError::Status {
        status: status.as_u16(),
        message,
    })
}

/// Decodes a response body, unwrapping the `{"data": ...}` envelope the
/// branch endpoints use.
fn parse<T: DeserializeOwned>(response: Response) -> Result<T, RemoteError> {
    let value: Value = check_status(response)?.json()?;
    let value = match value {
        Value::Object(mut map) if map.contains_key("data") => {
            map.remove("data").unwrap_or(Value::Null)
        }
        other => other,
    };
    serde_json::from_value(value).map_err(|e| RemoteError::Decode(e.to_string()))
}

fn token(value: &Value, field: &'static str) -> Result<String, RemoteError> {
    value
        .get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or(RemoteError::MissingField(field))
}

fn attach_file(form: Form, field: &'static str, path: &Path) -> Result<Form, RemoteError> {
    form.file(field, path).map_err(|source| RemoteError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn not_found_as_none<T>(res: Result<T, RemoteError>) -> Result<Option<T>, RemoteError> {
    match res {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

impl Remote for HttpRemote {
    fn repository(&mut self) -> Result<RepositoryInfo, RemoteError> {
        let url = self.url(&["repo", "hash", &self.repo])?;
        self.get(url)
    }

    fn list_branches(&mut self) -> Result<Vec<Branch>, RemoteError> {
        let url = self.branch_url(&[])?;
        let branches: Option<Vec<Branch>> = self.get(url)?;
        Ok(branches.unwrap_or_default())
    }

    fn branch_by_name(&mut self, name: &str) -> Result<Option<Branch>, RemoteError> {
        let url = self.branch_url(&["name", name])?;
        let branch: Option<Option<Branch>> = not_found_as_none(self.get(url))?;
        Ok(branch.flatten())
    }

    fn create_branch(&mut self, request: &CreateBranch) -> Result<Branch, RemoteError> {
        let url = self.branch_url(&["create"])?;
        self.post_json(url, request)
    }

    fn delete_branch(&mut self, branch_hash: &str) -> Result<(), RemoteError> {
        let url = self.branch_url(&["hash", branch_hash, "delete"])?;
        debug!(%url, "DELETE");
        let response = self.authorized(self.client.delete(url)).send()?;
        check_status(response)?;
        Ok(())
    }

    fn latest_commit(&mut self, branch_hash: &str) -> Result<Option<RemoteCommit>, RemoteError> {
        let url = self.branch_url(&["hash", branch_hash, "commit", "latest"])?;
        let commit: Option<Option<RemoteCommit>> = not_found_as_none(self.get(url))?;
        Ok(commit.flatten())
    }

    fn list_commits(&mut self, branch_hash: &str) -> Result<Vec<RemoteCommit>, RemoteError> {
        let url = self.branch_url(&["hash", branch_hash, "commit"])?;
        let commits: Option<Vec<RemoteCommit>> = self.get(url)?;
        Ok(commits.unwrap_or_default())
    }

    fn initiate(&mut self, branch_hash: &str, parent: &Parent) -> Result<Session, RemoteError> {
        let url = self.step_url(branch_hash, PushStep::Initiate)?;
        let body = serde_json::json!({ "parentCommitHash": parent.to_string() });
        let value: Value = self.post_json(url, &body)?;
        Ok(Session {
            session_id: token(&value, "sessionId")?,
            initiate_token: token(&value, "initiateToken")?,
        })
    }

    fn zkml_check(
        &mut self,
        branch_hash: &str,
        session: &Session,
        addresses: &ProofAddresses,
    ) -> Result<String, RemoteError> {
        let url = self.step_url(branch_hash, PushStep::ZkmlCheck)?;
        let body = serde_json::json!({
            "sessionId": session.session_id,
            "initiateToken": session.initiate_token,
            "proofCid": addresses.proof_cid,
            "settingsCid": addresses.settings_cid,
            "vkCid": addresses.vk_cid,
        });
        let value: Value = self.post_json(url, &body)?;
        token(&value, "zkmlToken")
    }

    fn zkml_upload(
        &mut self,
        branch_hash: &str,
        session: &Session,
        zkml_token: &str,
        files: ProofFiles<'_>,
    ) -> Result<String, RemoteError> {
        let url = self.step_url(branch_hash, PushStep::ZkmlUpload)?;
        let form = Form::new()
            .text("sessionId", session.session_id.clone())
            .text("initiateToken", session.initiate_token.clone())
            .text("zkmlToken", zkml_token.to_string());
        let form = attach_file(form, "proof", files.proof)?;
        let form = attach_file(form, "verification_key", files.verification_key)?;
        let form = attach_file(form, "settings", files.settings)?;
        let value = self.post_form(url, form)?;
        token(&value, "zkmlReceiptToken")
    }

    fn params_upload(
        &mut self,
        branch_hash: &str,
        session: &Session,
        zkml_receipt_token: &str,
        artifact: &Path,
        param_hash: &str,
    ) -> Result<ParamsReceipt, RemoteError> {
        let url = self.step_url(branch_hash, PushStep::ParamsUpload)?;
        let form = Form::new()
            .text("sessionId", session.session_id.clone())
            .text("initiateToken", session.initiate_token.clone())
            .text("zkmlReceiptToken", zkml_receipt_token.to_string())
            .text("paramHash", param_hash.to_string());
        let form = attach_file(form, "params", artifact)?;
        let value = self.post_form(url, form)?;
        Ok(ParamsReceipt {
            params_receipt_token: token(&value, "paramsReceiptToken")?,
            param_hash: value
                .get("paramHash")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }

    fn finalize(
        &mut self,
        branch_hash: &str,
        session: &Session,
        request: &FinalizeRequest,
    ) -> Result<CommitHash, RemoteError> {
        let url = self.step_url(branch_hash, PushStep::Finalize)?;
        let mut body = serde_json::to_value(request).map_err(|e| RemoteError::Decode(e.to_string()))?;
        if let Value::Object(map) = &mut body {
            map.insert("sessionId".into(), Value::String(session.session_id.clone()));
        }
        let value: Value = self.post_json(url, &body)?;
        token(&value, "commitHash").map(CommitHash::new)
    }

    fn fetch_artifacts(
        &mut self,
        branch_hash: &str,
    ) -> Result<Option<BranchArtifacts>, RemoteError> {
        let Some(head) = self.latest_commit(branch_hash)? else {
            return Ok(None);
        };
        let commit = head.commit_hash.as_str().to_string();
        let artifact = |name: &str| {
            self.branch_url(&["hash", branch_hash, "commit", "hash", &commit, name])
        };
        let Some(params) = self.get_bytes(artifact("params")?)? else {
            return Ok(None);
        };
        let proof = match (
            self.get_bytes(artifact("proof")?)?,
            self.get_bytes(artifact("verification_key")?)?,
            self.get_bytes(artifact("settings")?)?,
        ) {
            (Some(proof), Some(verification_key), Some(settings)) => Some(ProofBundle {
                proof,
                verification_key,
                settings,
            }),
            _ => None,
        };
        Ok(Some(BranchArtifacts {
            commit: head.commit_hash,
            params,
            param_hash: head.param_hash,
            proof,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote(base: &str) -> HttpRemote {
        let config = Config {
            api_base_url: base.to_string(),
            ..Config::default()
        };
        HttpRemote::new(&config, "repo1").unwrap()
    }

    #[test]
    fn step_urls_follow_commit_creation_namespace() {
        let remote = remote("http://ledger:2112/");
        let url = remote.step_url("b1", PushStep::ZkmlCheck).unwrap();
        assert_eq!(
            url.as_str(),
            "http://ledger:2112/repos/repo1/branches/b1/commits/create/zkml-check"
        );
    }

    #[test]
    fn branch_names_are_escaped() {
        let remote = remote("http://ledger:2112/api");
        let url = remote.branch_url(&["name", "feature/x y"]).unwrap();
        assert_eq!(
            url.as_str(),
            "http://ledger:2112/api/repo/hash/repo1/branch/name/feature%2Fx%20y"
        );
    }

    #[test]
    fn missing_token_is_reported_by_name() {
        let value = serde_json::json!({ "sessionId": "s" });
        assert!(matches!(
            token(&value, "initiateToken"),
            Err(RemoteError::MissingField("initiateToken"))
        ));
    }
}
