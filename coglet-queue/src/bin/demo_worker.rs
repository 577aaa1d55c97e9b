//! Demonstration worker exposing a handful of fixture models.
//!
//! `DEMO_MODEL` picks the model; `DEMO_SETUP_SECONDS` delays setup;
//! `DEMO_OUTPUT_DIR` is where file outputs are written.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};

use coglet_queue::output::file_ref;
use coglet_queue::{PredictContext, PredictError, PredictHandler, SetupError, WorkerConfig, run_worker};

#[derive(Debug, Clone, Copy, PartialEq)]
enum Model {
    /// `{text, path}`: downloads `path`, writes "foo" + text + contents to a file.
    Files,
    /// Yields "foo", "bar", "baz".
    Yielding,
    /// Yields three files.
    YieldingFile,
    Failing,
    FailingAfterOutput,
    /// `{num: integer}` -> `num * 2`, with an input schema.
    Int,
    Logging,
    /// `{sleep_time}` -> "it worked after {sleep_time} seconds!".
    Sleep,
    /// `{sleep_time, n_iterations}`: yields "yield {i}" after each sleep.
    YieldingTimeout,
    Complex,
    YieldingComplexList,
    SetupFail,
    /// Exits the process in the middle of a prediction.
    Crash,
    /// Blocks its thread, so cancellation is never acknowledged.
    IgnoresCancel,
    /// The first process exits shortly after setup, before any prediction.
    /// Later ones stay up and return "still here".
    IdleExit,
    /// Like `IdleExit`, but every later setup fails.
    IdleExitThenBroken,
}

impl Model {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "files" => Self::Files,
            "yielding" => Self::Yielding,
            "yielding_file" => Self::YieldingFile,
            "failing" => Self::Failing,
            "failing_after_output" => Self::FailingAfterOutput,
            "int" => Self::Int,
            "logging" => Self::Logging,
            "sleep" => Self::Sleep,
            "yielding_timeout" => Self::YieldingTimeout,
            "complex" => Self::Complex,
            "yielding_complex_list" => Self::YieldingComplexList,
            "setup_fail" => Self::SetupFail,
            "crash" => Self::Crash,
            "ignores_cancel" => Self::IgnoresCancel,
            "idle_exit" => Self::IdleExit,
            "idle_exit_then_broken" => Self::IdleExitThenBroken,
            _ => return None,
        })
    }
}

struct Demo {
    model: Model,
    setup_delay: Duration,
    output_dir: PathBuf,
}

fn str_input<'a>(input: &'a Value, name: &str) -> Result<&'a str, PredictError> {
    input
        .get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| PredictError::new(format!("missing input {name}")))
}

fn f64_input(input: &Value, name: &str, default: f64) -> f64 {
    input.get(name).and_then(Value::as_f64).unwrap_or(default)
}

fn traceback(message: &str) -> String {
    format!(
        "Traceback (most recent call last):\n  File \"predict.py\", line 12, in predict\nException: {message}"
    )
}

impl Demo {
    fn write_output(&self, name: &str, contents: &str) -> Result<Value, PredictError> {
        let path = self.output_dir.join(name);
        std::fs::write(&path, contents)
            .map_err(|e| PredictError::new(format!("failed to write {}: {e}", path.display())))?;
        Ok(file_ref(&path))
    }

    fn emit(ctx: &PredictContext, value: Value) -> Result<(), PredictError> {
        ctx.yield_output(value)
            .map_err(|e| PredictError::new(e.to_string()))
    }
}

async fn download(url: String) -> Result<String, PredictError> {
    tokio::task::spawn_blocking(move || {
        let agent = ureq::Agent::config_builder()
            .timeout_global(Some(Duration::from_secs(30)))
            .build()
            .new_agent();
        let mut response = agent.get(&url).call()?;
        response.body_mut().read_to_string()
    })
    .await
    .map_err(|e| PredictError::new(e.to_string()))?
    .map_err(|e| PredictError::new(format!("failed to download input: {e}")))
}

#[async_trait::async_trait]
impl PredictHandler for Demo {
    async fn setup(&self) -> Result<(), SetupError> {
        println!("setting up {:?}", self.model);
        tokio::time::sleep(self.setup_delay).await;
        if self.model == Model::SetupFail {
            eprintln!("could not find weights");
            return Err(SetupError::load("weights not found"));
        }
        std::fs::create_dir_all(&self.output_dir)
            .map_err(|e| SetupError::setup(e.to_string()))?;
        if matches!(self.model, Model::IdleExit | Model::IdleExitThenBroken) {
            let marker = self.output_dir.join("idle-exit.marker");
            if marker.exists() && self.model == Model::IdleExitThenBroken {
                eprintln!("weights disappeared");
                return Err(SetupError::load("weights not found"));
            }
            if !marker.exists() {
                std::fs::write(&marker, "exited")
                    .map_err(|e| SetupError::setup(e.to_string()))?;
                tokio::spawn(async {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    process::exit(0);
                });
            }
        }
        println!("setup done");
        Ok(())
    }

    async fn predict(
        &self,
        input: Value,
        ctx: PredictContext,
    ) -> Result<Option<Value>, PredictError> {
        match self.model {
            Model::Files => {
                let text = str_input(&input, "text")?;
                let contents = download(str_input(&input, "path")?.to_string()).await?;
                let file = self.write_output("output.txt", &format!("foo{text}{contents}"))?;
                Ok(Some(file))
            }
            Model::Yielding => {
                for word in ["foo", "bar", "baz"] {
                    Self::emit(&ctx, json!(word))?;
                }
                Ok(None)
            }
            Model::YieldingFile => {
                for (i, word) in ["foo", "bar", "baz"].iter().enumerate() {
                    let file = self.write_output(&format!("out-{i}.txt"), &format!("test {word}"))?;
                    Self::emit(&ctx, file)?;
                }
                Ok(None)
            }
            Model::Failing => {
                eprintln!("{}", traceback("over budget"));
                Err(PredictError::new("over budget"))
            }
            Model::FailingAfterOutput => {
                Self::emit(&ctx, json!("hello bar"))?;
                println!("a printed log message");
                Err(PredictError::new("mid run error").with_traceback(traceback("mid run error")))
            }
            Model::Int => {
                let num = input
                    .get("num")
                    .and_then(Value::as_i64)
                    .ok_or_else(|| PredictError::new("num is not an integer"))?;
                Ok(Some(json!(num * 2)))
            }
            Model::Logging => {
                eprintln!("WARNING:root:writing log message");
                println!("writing from C");
                eprintln!("writing to stderr");
                println!("writing with print");
                Ok(Some(json!("output")))
            }
            Model::Sleep => {
                let seconds = f64_input(&input, "sleep_time", 0.0);
                tokio::time::sleep(Duration::from_secs_f64(seconds)).await;
                Ok(Some(json!(format!("it worked after {seconds} seconds!"))))
            }
            Model::YieldingTimeout => {
                let seconds = f64_input(&input, "sleep_time", 0.0);
                let iterations = input
                    .get("n_iterations")
                    .and_then(Value::as_u64)
                    .unwrap_or(1);
                for i in 0..iterations {
                    tokio::time::sleep(Duration::from_secs_f64(seconds)).await;
                    Self::emit(&ctx, json!(format!("yield {i}")))?;
                }
                Ok(None)
            }
            Model::Complex => {
                let name = str_input(&input, "name")?;
                Ok(Some(json!({
                    "hello": format!("hello {name}"),
                    "goodbye": format!("goodbye {name}"),
                })))
            }
            Model::YieldingComplexList => {
                let file = self.write_output("hello.txt", "hello")?;
                Self::emit(&ctx, json!([{"text": "hello", "file": file}]))?;
                Ok(None)
            }
            Model::SetupFail => Err(PredictError::new("not set up")),
            Model::Crash => {
                println!("about to crash");
                process::exit(1);
            }
            Model::IgnoresCancel => {
                println!("not listening");
                std::thread::sleep(Duration::from_secs(60));
                Ok(Some(json!("finished anyway")))
            }
            Model::IdleExit | Model::IdleExitThenBroken => Ok(Some(json!("still here"))),
        }
    }

    fn schema(&self) -> Option<Value> {
        (self.model == Model::Int).then(|| {
            json!({
                "openapi": "3.0.2",
                "components": {"schemas": {"Input": {
                    "type": "object",
                    "title": "Input",
                    "properties": {"num": {"type": "integer", "title": "Num"}},
                    "required": ["num"]
                }}}
            })
        })
    }
}

#[tokio::main]
async fn main() {
    let name = std::env::var("DEMO_MODEL").unwrap_or_else(|_| "files".to_string());
    let Some(model) = Model::from_name(&name) else {
        eprintln!("unknown DEMO_MODEL {name:?}");
        process::exit(2);
    };
    let setup_delay = std::env::var("DEMO_SETUP_SECONDS")
        .ok()
        .and_then(|s| s.parse::<f64>().ok())
        .and_then(|s| Duration::try_from_secs_f64(s).ok())
        .unwrap_or_default();
    let output_dir = std::env::var_os("DEMO_OUTPUT_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| std::env::temp_dir().join(format!("coglet-demo-{}", process::id())));

    let demo = Demo {
        model,
        setup_delay,
        output_dir,
    };
    if let Err(e) = run_worker(Arc::new(demo), WorkerConfig::default()).await {
        eprintln!("worker failed: {e}");
        process::exit(1);
    }
}
