//! External program provider.
//!
//! Each call spawns `<command> [args...] <op> <kind> <address>` with a JSON
//! request on stdin and reads a JSON response from stdout.
//!
//! Exit status contract:
//! - 0: success (`apply` prints the observed attribute object, `read`
//!   prints an object or `null`)
//! - 75 (EX_TEMPFAIL): transient failure, retried
//! - anything else: permanent failure; stderr becomes the message

use super::{ApplyRequest, DeleteRequest, Provider, ProviderError};
use crate::core::types::{Address, Attributes, Context, ProviderConfig};
use async_trait::async_trait;
use serde::Serialize;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Exit status signalling a retryable failure.
pub const EXIT_TRANSIENT: i32 = 75;

#[derive(Serialize)]
struct TargetRequest<'a> {
    context: &'a Context,
    kind: &'a str,
    address: &'a Address,
}

/// Provider backed by an external executable.
#[derive(Debug, Clone)]
pub struct CommandProvider {
    program: String,
    args: Vec<String>,
}

impl CommandProvider {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Build from the declaration's `provider:` section, if configured.
    pub fn from_config(config: &ProviderConfig) -> Option<Self> {
        config
            .command
            .as_ref()
            .map(|c| Self::new(c.clone(), config.args.clone()))
    }

    async fn invoke<T: Serialize>(
        &self,
        op: &str,
        kind: &str,
        address: &Address,
        payload: &T,
    ) -> Result<serde_json::Value, ProviderError> {
        let input = serde_json::to_vec(payload)
            .map_err(|e| ProviderError::Permanent(format!("cannot encode request: {}", e)))?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(op)
            .arg(kind)
            .arg(address.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ProviderError::Permanent(format!("failed to spawn {}: {}", self.program, e)))?;

        // Feed stdin while draining stdout/stderr; a provider may write
        // more than a pipe buffer before it reads its request.
        let stdin = child.stdin.take();
        let feed = async {
            if let Some(mut stdin) = stdin {
                // A provider may exit without reading stdin; a broken pipe
                // is not a failure on its own.
                if let Err(e) = stdin.write_all(&input).await {
                    tracing::debug!(program = %self.program, error = %e, "stdin write failed");
                }
            }
        };
        let ((), output) = tokio::join!(feed, child.wait_with_output());
        let output = output.map_err(|e| ProviderError::Transient(format!("wait error: {}", e)))?;

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        match output.status.code() {
            Some(0) => {}
            Some(EXIT_TRANSIENT) => return Err(ProviderError::Transient(describe(op, address, &stderr))),
            Some(code) => {
                return Err(ProviderError::Permanent(format!(
                    "{} (exit {})",
                    describe(op, address, &stderr),
                    code
                )))
            }
            None => {
                return Err(ProviderError::Transient(format!(
                    "{} {} terminated by signal",
                    op, address
                )))
            }
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        if stdout.trim().is_empty() {
            return Ok(serde_json::Value::Null);
        }
        serde_json::from_str(stdout.trim())
            .map_err(|e| ProviderError::Permanent(format!("invalid provider output for {}: {}", address, e)))
    }
}

fn describe(op: &str, address: &Address, stderr: &str) -> String {
    if stderr.is_empty() {
        format!("{} {} failed", op, address)
    } else {
        format!("{} {}: {}", op, address, stderr)
    }
}

fn into_attributes(value: serde_json::Value, address: &Address) -> Result<Attributes, ProviderError> {
    match value {
        serde_json::Value::Object(map) => Ok(map.into_iter().collect()),
        other => Err(ProviderError::Permanent(format!(
            "provider returned {} for {}, expected an object",
            other, address
        ))),
    }
}

#[async_trait]
impl Provider for CommandProvider {
    async fn apply(&self, request: &ApplyRequest) -> Result<Attributes, ProviderError> {
        let op = request.operation.to_string();
        let out = self
            .invoke(&op, &request.kind, &request.address, request)
            .await?;
        into_attributes(out, &request.address)
    }

    async fn delete(&self, request: &DeleteRequest) -> Result<(), ProviderError> {
        self.invoke("delete", &request.kind, &request.address, request)
            .await?;
        Ok(())
    }

    async fn read(
        &self,
        ctx: &Context,
        kind: &str,
        address: &Address,
    ) -> Result<Option<Attributes>, ProviderError> {
        let payload = TargetRequest {
            context: ctx,
            kind,
            address,
        };
        match self.invoke("read", kind, address, &payload).await? {
            serde_json::Value::Null => Ok(None),
            other => into_attributes(other, address).map(Some),
        }
    }

    fn name(&self) -> &str {
        &self.program
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::StepOperation;
    use serde_json::json;

    /// `sh -c <script> sh <op> <kind> <address>`: op/kind/address land in $1..$3.
    fn script(body: &str) -> CommandProvider {
        CommandProvider::new("sh", vec!["-c".into(), body.into(), "sh".into()])
    }

    fn request() -> ApplyRequest {
        let mut attributes = Attributes::new();
        attributes.insert("name".into(), json!("main"));
        ApplyRequest {
            context: Context::new("default"),
            kind: "network".into(),
            address: "network.vpc".parse().unwrap(),
            operation: StepOperation::Create,
            attributes,
            prior: None,
        }
    }

    #[tokio::test]
    async fn test_apply_passes_arguments() {
        let p = script(r#"cat >/dev/null; printf '{"op":"%s","kind":"%s","addr":"%s"}' "$1" "$2" "$3""#);
        let out = p.apply(&request()).await.unwrap();
        assert_eq!(out["op"], json!("create"));
        assert_eq!(out["kind"], json!("network"));
        assert_eq!(out["addr"], json!("network.vpc"));
    }

    #[tokio::test]
    async fn test_apply_sends_request_on_stdin() {
        let p = script("cat");
        let out = p.apply(&request()).await.unwrap();
        assert_eq!(out["address"], json!("network.vpc"));
        assert_eq!(out["attributes"]["name"], json!("main"));
    }

    #[tokio::test]
    async fn test_large_output_before_reading_request() {
        // 200 KB of output before touching stdin, with a request larger
        // than a pipe buffer.
        let p = script(
            r#"printf '{"big":"'; head -c 200000 /dev/zero | tr '\0' a; printf '"}'; cat >/dev/null"#,
        );
        let mut req = request();
        req.attributes.insert("blob".into(), json!("x".repeat(200_000)));
        let out = tokio::time::timeout(std::time::Duration::from_secs(20), p.apply(&req))
            .await
            .expect("provider call deadlocked")
            .unwrap();
        assert_eq!(out["big"].as_str().unwrap().len(), 200_000);
    }

    #[tokio::test]
    async fn test_exit_75_is_transient() {
        let p = script("echo 'rate limited' >&2; exit 75");
        let err = p.apply(&request()).await.unwrap_err();
        assert!(err.is_transient());
        assert!(err.message().contains("rate limited"));
    }

    #[tokio::test]
    async fn test_other_exit_is_permanent() {
        let p = script("echo 'quota exceeded' >&2; exit 3");
        let err = p.apply(&request()).await.unwrap_err();
        assert!(!err.is_transient());
        assert!(err.message().contains("quota exceeded"));
        assert!(err.message().contains("exit 3"));
    }

    #[tokio::test]
    async fn test_non_object_output_rejected() {
        let p = script("cat >/dev/null; echo '[1,2]'");
        let err = p.apply(&request()).await.unwrap_err();
        assert!(matches!(err, ProviderError::Permanent(_)));
    }

    #[tokio::test]
    async fn test_read_null_is_absent() {
        let p = script("cat >/dev/null; echo null");
        let ctx = Context::new("default");
        let out = p
            .read(&ctx, "network", &"network.vpc".parse().unwrap())
            .await
            .unwrap();
        assert!(out.is_none());
    }

    #[tokio::test]
    async fn test_delete_ok() {
        let p = script("grep -q net-1 && exit 0; exit 3");
        let mut attributes = Attributes::new();
        attributes.insert("id".into(), json!("net-1"));
        let request = DeleteRequest {
            context: Context::new("default"),
            kind: "network".into(),
            address: "network.vpc".parse().unwrap(),
            attributes,
        };
        p.delete(&request).await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_program() {
        let p = CommandProvider::new("/nonexistent/terrane-provider", vec![]);
        let err = p.apply(&request()).await.unwrap_err();
        assert!(matches!(err, ProviderError::Permanent(_)));
    }

    #[test]
    fn test_from_config() {
        let cfg = ProviderConfig {
            command: Some("./provider.sh".into()),
            args: vec!["--verbose".into()],
        };
        let p = CommandProvider::from_config(&cfg).unwrap();
        assert_eq!(p.name(), "./provider.sh");
        assert!(CommandProvider::from_config(&ProviderConfig::default()).is_none());
    }
}
