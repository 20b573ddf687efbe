//! Commands available to every kiln binary.

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::process::Command as Process;
use tracing::debug;

use crate::{Command, CommandError, CommandRegistry, CommandResult, Context, Invocation};

/// Runs `sh -c <script>` and returns its exit status and output.
///
/// The script is the first positional argument; an optional `cwd` keyword
/// sets the working directory. A non-zero exit status fails the job.
pub struct Shell;

#[async_trait]
impl Command for Shell {
    async fn run(&self, _context: Option<&mut Context>, invocation: Invocation) -> CommandResult {
        let script: String = invocation.arg_as(0)?;
        let cwd: Option<String> = invocation.kwarg_as("cwd")?;

        let mut process = Process::new("sh");
        process.arg("-c").arg(&script);
        if let Some(cwd) = &cwd {
            process.current_dir(cwd);
        }
        debug!(script = %script, "Running shell command");
        let output = process
            .output()
            .await
            .map_err(|e| CommandError::failed(format!("could not spawn sh: {}", e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if !output.status.success() {
            return Err(CommandError::failed(format!(
                "command exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        Ok(json!({
            "status": output.status.code(),
            "stdout": stdout,
            "stderr": stderr,
        }))
    }
}

fn echo(invocation: Invocation) -> CommandResult {
    let mut args = invocation.args;
    Ok(match args.len() {
        0 => Value::Null,
        1 => args.remove(0),
        _ => Value::Array(args),
    })
}

/// Concatenates strings, or arrays, given as positional arguments.
fn concat(invocation: Invocation) -> CommandResult {
    if invocation.args.iter().all(Value::is_string) {
        let joined: String = invocation
            .args
            .iter()
            .filter_map(Value::as_str)
            .collect();
        return Ok(Value::String(joined));
    }
    let mut items = Vec::new();
    for arg in invocation.args {
        match arg {
            Value::Array(values) => items.extend(values),
            other => {
                return Err(CommandError::failed(format!(
                    "concat expects all strings or all arrays, got {}",
                    other
                )));
            }
        }
    }
    Ok(Value::Array(items))
}

/// A registry holding the builtin commands `shell`, `echo` and `concat`.
pub fn builtin_registry() -> CommandRegistry {
    let mut registry = CommandRegistry::new();
    registry.register("shell", Shell);
    registry.register_fn("echo", echo);
    registry.register_fn("concat", concat);
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn positional(args: Vec<Value>) -> Invocation {
        Invocation::new(args, BTreeMap::new())
    }

    #[test]
    fn test_echo() {
        assert_eq!(echo(positional(vec![])).unwrap(), Value::Null);
        assert_eq!(echo(positional(vec![json!(1)])).unwrap(), json!(1));
        assert_eq!(
            echo(positional(vec![json!(1), json!("a")])).unwrap(),
            json!([1, "a"])
        );
    }

    #[test]
    fn test_concat() {
        assert_eq!(
            concat(positional(vec![json!("ab"), json!("cd")])).unwrap(),
            json!("abcd")
        );
        assert_eq!(
            concat(positional(vec![json!([1]), json!([2, 3])])).unwrap(),
            json!([1, 2, 3])
        );
        assert!(concat(positional(vec![json!([1]), json!(2)])).is_err());
    }

    #[tokio::test]
    async fn test_shell() {
        let out = Shell
            .run(None, positional(vec![json!("echo hello")]))
            .await
            .unwrap();
        assert_eq!(out["stdout"], "hello\n");
        assert_eq!(out["status"], 0);

        let err = Shell
            .run(None, positional(vec![json!("echo oops >&2; exit 3")]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("oops"));
    }

    #[test]
    fn test_builtin_registry() {
        assert_eq!(builtin_registry().names(), vec!["concat", "echo", "shell"]);
    }
}
