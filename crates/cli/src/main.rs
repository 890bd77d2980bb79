use anyhow::Context;
use chrono::NaiveDateTime;
use clap::{Args, Parser, Subcommand};
use formentry_core::{
    CoreConfig, Encounter, FormEntrySession, InMemoryFactRepository, InMemoryMetadata, Mode,
    ProgramEnrollment, SessionRequest, Subject, Submission, SubmissionOutcome,
};
use serde::de::DeserializeOwned;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const NOW_FORMAT: &str = "%Y-%m-%dT%H:%M";

#[derive(Parser)]
#[command(name = "formentry")]
#[command(about = "Clinical form entry engine CLI")]
struct Cli {
    /// Core configuration file (YAML); falls back to FORMENTRY_CONFIG
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Render a form to HTML
    Render(FormArgs),
    /// Validate and apply a submission, printing the new encounter or the field errors
    Submit {
        #[command(flatten)]
        form: FormArgs,
        /// Write the resulting encounter (YAML) to this file
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Print the schema of a form
    Schema {
        #[command(flatten)]
        form: FormArgs,
        /// Print JSON instead of YAML
        #[arg(long)]
        json: bool,
    },
    /// Print a template after comment stripping, escaping and macro expansion
    Expand {
        /// Template file
        template: PathBuf,
    },
}

#[derive(Args)]
struct FormArgs {
    /// Template file
    template: PathBuf,
    /// Metadata dictionary (YAML)
    #[arg(long)]
    metadata: PathBuf,
    /// Subject the form is filled in for (YAML)
    #[arg(long)]
    subject: PathBuf,
    /// Stored encounter (YAML); required in EDIT and VIEW mode
    #[arg(long)]
    encounter: Option<PathBuf>,
    /// Program enrollments of the subject (YAML list)
    #[arg(long)]
    enrollments: Option<PathBuf>,
    /// Submitted field values (YAML map of field name to value)
    #[arg(long)]
    submission: Option<PathBuf>,
    /// ENTER, EDIT or VIEW
    #[arg(long, default_value = "enter")]
    mode: Mode,
    /// Clock override, as YYYY-MM-DDTHH:MM
    #[arg(long)]
    now: Option<String>,
}

fn read(path: &Path) -> anyhow::Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

fn load_yaml<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    serde_yaml::from_str(&read(path)?).with_context(|| format!("failed to parse {}", path.display()))
}

/// Resolve configuration once: the `--config` file, then `FORMENTRY_CONFIG`, then a default
/// named after the template.
fn load_config(path: Option<PathBuf>, template: &Path) -> anyhow::Result<CoreConfig> {
    let path = path.or_else(|| std::env::var_os("FORMENTRY_CONFIG").map(PathBuf::from));
    match path {
        Some(path) => Ok(CoreConfig::from_yaml_str(&read(&path)?)?),
        None => {
            let name = template
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("form")
                .replace(['.', '/'], "_");
            Ok(CoreConfig::new(name, "1.0".into())?)
        }
    }
}

struct LoadedForm {
    session: FormEntrySession,
    encounter: Option<Encounter>,
    enrollments: Vec<ProgramEnrollment>,
    submission: Option<Submission>,
}

fn open_form(config: Option<PathBuf>, args: FormArgs, redisplay: bool) -> anyhow::Result<LoadedForm> {
    let cfg = Arc::new(load_config(config, &args.template)?);
    let metadata = InMemoryMetadata::from_yaml_str(&read(&args.metadata)?)?;
    let subject: Subject = load_yaml(&args.subject)?;
    let encounter: Option<Encounter> = args.encounter.as_deref().map(load_yaml).transpose()?;
    let enrollments: Vec<ProgramEnrollment> = args
        .enrollments
        .as_deref()
        .map(load_yaml)
        .transpose()?
        .unwrap_or_default();
    let submission: Option<Submission> = args.submission.as_deref().map(load_yaml).transpose()?;
    let now = match &args.now {
        Some(raw) => NaiveDateTime::parse_from_str(raw, NOW_FORMAT)
            .with_context(|| format!("--now must look like 2024-03-15T10:30, got '{raw}'"))?,
        None => chrono::Local::now().naive_local(),
    };

    let mut request = SessionRequest::new(read(&args.template)?, args.mode, subject, now)
        .with_enrollments(enrollments.clone());
    if let Some(encounter) = &encounter {
        request = request.with_encounter(encounter.clone());
    }
    if redisplay {
        if let Some(submission) = &submission {
            request = request.with_submission(submission.clone(), Vec::new());
        }
    }

    let session = FormEntrySession::open(cfg, Arc::new(metadata), request)?;
    Ok(LoadedForm {
        session,
        encounter,
        enrollments,
        submission,
    })
}

fn run(cli: Cli, out: &mut impl Write) -> anyhow::Result<()> {
    match cli.command {
        Commands::Render(args) => {
            let form = open_form(cli.config, args, true)?;
            if form.session.is_guessing() {
                tracing::warn!("stored facts were matched to fields by guessing");
            }
            writeln!(out, "{}", form.session.html())?;
        }
        Commands::Submit { form, out: target } => {
            let form = open_form(cli.config, form, false)?;
            let submission = form
                .submission
                .clone()
                .context("submit needs --submission")?;
            let mut repository = InMemoryFactRepository::new();
            if let Some(encounter) = form.encounter {
                repository = repository.with_encounter(encounter);
            }
            for enrollment in form.enrollments {
                repository = repository.with_enrollment(enrollment);
            }

            match form.session.submit(&submission, &mut repository)? {
                SubmissionOutcome::Saved(changes) => {
                    let yaml = serde_yaml::to_string(&changes)?;
                    match target {
                        Some(path) => {
                            std::fs::write(&path, serde_yaml::to_string(&changes.encounter)?)
                                .with_context(|| format!("failed to write {}", path.display()))?;
                            tracing::info!("wrote encounter {} to {}", changes.encounter.id, path.display());
                        }
                        None => write!(out, "{yaml}")?,
                    }
                }
                SubmissionOutcome::Invalid(errors) => {
                    write!(out, "{}", serde_yaml::to_string(&errors)?)?;
                    anyhow::bail!("submission has {} field errors", errors.len());
                }
            }
        }
        Commands::Schema { form, json } => {
            let form = open_form(cli.config, form, false)?;
            let schema = form.session.schema();
            if json {
                writeln!(out, "{}", serde_json::to_string_pretty(schema)?)?;
            } else {
                write!(out, "{}", serde_yaml::to_string(schema)?)?;
            }
        }
        Commands::Expand { template } => {
            let text = formentry_core::template::preprocess(&read(&template)?);
            writeln!(out, "{text}")?;
        }
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive("formentry=info".parse()?))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let stdout = std::io::stdout();
    run(cli, &mut stdout.lock())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const METADATA: &str = r#"
concepts:
  - id: 5089
    name: Weight (kg)
    datatype:
      type: numeric
      low: 0
      high: 250
      precise: true
"#;

    const SUBJECT: &str = r#"
person_id: 7
gender: F
birthdate: 1990-06-01
"#;

    const TEMPLATE: &str = r#"<htmlform><!-- weight --><obs conceptId="5089" labelText="Weight"/></htmlform>"#;

    fn write(dir: &TempDir, name: &str, contents: &str) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, contents).expect("write fixture");
        path
    }

    fn cli(dir: &TempDir, command: &str, extra: &[&str]) -> Cli {
        let template = write(dir, "vitals.xml", TEMPLATE);
        let metadata = write(dir, "metadata.yaml", METADATA);
        let subject = write(dir, "subject.yaml", SUBJECT);
        let mut args = vec![
            "formentry".to_owned(),
            command.to_owned(),
            template.display().to_string(),
            "--metadata".to_owned(),
            metadata.display().to_string(),
            "--subject".to_owned(),
            subject.display().to_string(),
            "--now".to_owned(),
            "2024-03-15T10:30".to_owned(),
        ];
        args.extend(extra.iter().map(|s| s.to_string()));
        Cli::try_parse_from(args).expect("arguments parse")
    }

    fn output(cli: Cli) -> anyhow::Result<String> {
        let mut out = Vec::new();
        run(cli, &mut out)?;
        Ok(String::from_utf8(out).expect("utf-8 output"))
    }

    #[test]
    fn test_render_prints_html() {
        let dir = TempDir::new().expect("temp dir");

        let html = output(cli(&dir, "render", &[])).expect("renders");

        assert!(html.starts_with(r#"<div class="htmlform">"#));
        assert!(html.contains(r#"<label for="w1">Weight</label>"#));
    }

    #[test]
    fn test_submit_prints_new_encounter() {
        let dir = TempDir::new().expect("temp dir");
        let submission = write(&dir, "submission.yaml", "w1: \"64\"\n");
        let submission = submission.display().to_string();

        let yaml = output(cli(&dir, "submit", &["--submission", &submission])).expect("submits");

        assert!(yaml.contains("created: 1"));
        assert!(yaml.contains("type: numeric"));
    }

    #[test]
    fn test_submit_reports_field_errors() {
        let dir = TempDir::new().expect("temp dir");
        let submission = write(&dir, "submission.yaml", "w1: heavy\n");
        let submission = submission.display().to_string();
        let mut out = Vec::new();

        let err = run(cli(&dir, "submit", &["--submission", &submission]), &mut out).unwrap_err();

        assert!(err.to_string().contains("1 field errors"));
        assert!(String::from_utf8_lossy(&out).contains("Must be a number"));
    }

    #[test]
    fn test_submit_writes_encounter_file() {
        let dir = TempDir::new().expect("temp dir");
        let submission = write(&dir, "submission.yaml", "w1: \"64\"\n");
        let target = dir.path().join("encounter.yaml");
        let (submission, target_arg) = (submission.display().to_string(), target.display().to_string());

        output(cli(&dir, "submit", &["--submission", &submission, "--out", &target_arg])).expect("submits");

        let encounter: Encounter = load_yaml(&target).expect("encounter written");
        assert_eq!(encounter.obs.len(), 1);
    }

    #[test]
    fn test_schema_is_yaml() {
        let dir = TempDir::new().expect("temp dir");

        let yaml = output(cli(&dir, "schema", &[])).expect("prints schema");

        assert!(yaml.contains("name: vitals"));
        assert!(yaml.contains("kind: obs"));
    }

    #[test]
    fn test_schema_as_json() {
        let dir = TempDir::new().expect("temp dir");

        let json = output(cli(&dir, "schema", &["--json"])).expect("prints schema");
        let value: serde_json::Value = serde_json::from_str(&json).expect("valid json");

        assert_eq!(value["name"], "vitals");
    }

    #[test]
    fn test_expand_strips_comments() {
        let dir = TempDir::new().expect("temp dir");
        let template = write(&dir, "vitals.xml", TEMPLATE);
        let cli = Cli::try_parse_from(["formentry", "expand", template.to_str().expect("utf-8 path")])
            .expect("arguments parse");

        let text = output(cli).expect("expands");

        assert!(!text.contains("weight -->"));
        assert!(text.contains(r#"conceptId="5089""#));
    }

    #[test]
    fn test_config_file_names_the_form() {
        let dir = TempDir::new().expect("temp dir");
        let config = write(&dir, "config.yaml", "form_name: Vitals\nform_version: \"2.0\"\n");

        let cfg = load_config(Some(config), Path::new("ignored.xml")).expect("loads");

        assert_eq!(cfg.form_name(), "Vitals");
        assert_eq!(cfg.form_version(), "2.0");
    }

    #[test]
    fn test_mode_argument_is_validated() {
        let dir = TempDir::new().expect("temp dir");
        let template = write(&dir, "vitals.xml", TEMPLATE);
        let parsed = Cli::try_parse_from([
            "formentry",
            "render",
            template.to_str().expect("utf-8 path"),
            "--metadata",
            "m.yaml",
            "--subject",
            "s.yaml",
            "--mode",
            "review",
        ]);

        assert!(parsed.is_err());
    }
}
