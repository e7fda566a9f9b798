use ace_core::{acquire_workspace_lock, Layout};
use ace_runner::{
    describe_workspace, DesyncPolicy, ExplorePlan, Journal, ProcessEngine, SearchOptions,
    SwarmPlan, Trainer,
};
use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

const CONFIG_FILE: &str = "ace.yaml";

#[derive(Parser)]
#[command(
    name = "ace",
    version = "0.3.0",
    about = "Checkpoint search over an external agent-economy training engine"
)]
struct Cli {
    /// Workspace holding settings.json, models/ and runs/.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,
    /// Config file; defaults to <root>/ace.yaml when present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, short, global = true)]
    verbose: bool,
    /// Engine command line, split on whitespace.
    #[arg(long, global = true)]
    engine: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum DesyncArg {
    #[value(name = "abort")]
    Abort,
    #[value(name = "reload")]
    Reload,
    #[value(name = "proceed")]
    Proceed,
}

impl From<DesyncArg> for DesyncPolicy {
    fn from(value: DesyncArg) -> Self {
        match value {
            DesyncArg::Abort => DesyncPolicy::Abort,
            DesyncArg::Reload => DesyncPolicy::ReloadThenProceed,
            DesyncArg::Proceed => DesyncPolicy::ProceedAnyway,
        }
    }
}

#[derive(Args, Clone, Debug)]
struct SearchArgs {
    #[arg(long)]
    persons: Option<u32>,
    #[arg(long)]
    firms: Option<u32>,
    #[arg(long)]
    episode_length: Option<u32>,
    #[arg(long)]
    trial_episodes: Option<u32>,
    #[arg(long)]
    trial_margin: Option<f64>,
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long, value_enum)]
    on_desync: Option<DesyncArg>,
    /// Configuration field edit, e.g. trainingParams.hiddenSize=200.
    #[arg(long = "set")]
    set_values: Vec<String>,
    #[arg(long)]
    json: bool,
}

impl SearchArgs {
    fn apply(&self, options: &mut SearchOptions) -> Result<()> {
        if let Some(v) = self.persons {
            options.num_persons = v;
        }
        if let Some(v) = self.firms {
            options.num_firms = v;
        }
        if let Some(v) = self.episode_length {
            options.episode_length = v;
        }
        if let Some(v) = self.trial_episodes {
            options.trial_episodes = v;
        }
        if let Some(v) = self.trial_margin {
            options.trial_margin = v;
        }
        if let Some(v) = self.seed {
            options.seed = v;
        }
        if let Some(v) = self.on_desync {
            options.on_desync = v.into();
        }
        options.overrides.extend(parse_set_bindings(&self.set_values)?);
        Ok(())
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Explore fresh initializations, then train the winner slowly.
    Train {
        #[command(flatten)]
        search: SearchArgs,
        #[arg(long)]
        fast_lr: Option<f32>,
        #[arg(long)]
        slow_lr: Option<f32>,
        #[arg(long)]
        attempts: Option<usize>,
        #[arg(long)]
        attempt_episodes: Option<u32>,
        #[arg(long)]
        episodes: Option<u32>,
    },
    /// Seed a host checkpoint and iterate swarm generations.
    Swarm {
        #[command(flatten)]
        search: SearchArgs,
        #[arg(long)]
        swarm_size: Option<usize>,
        #[arg(long)]
        episodes: Option<u32>,
        #[arg(long)]
        lr: Option<f32>,
        #[arg(long)]
        perturbation: Option<f64>,
        #[arg(long)]
        decay: Option<f64>,
        #[arg(long)]
        iterations: Option<usize>,
        #[arg(long)]
        explore_attempts: Option<usize>,
        #[arg(long)]
        explore_episodes: Option<u32>,
    },
    /// Run the simulation once with the primary checkpoint.
    Run {
        #[command(flatten)]
        search: SearchArgs,
    },
    /// Show the settings record, its sync state and checkpoint slots.
    Describe {
        #[command(flatten)]
        search: SearchArgs,
        #[arg(long, default_value_t = 10)]
        attempt_slots: usize,
    },
    /// Write a default ace.yaml into the workspace.
    Init {
        #[arg(long)]
        force: bool,
    },
    Clean {
        /// Remove search journals.
        #[arg(long)]
        runs: bool,
        /// Remove host and attempt slots, keeping the primary checkpoint.
        #[arg(long)]
        slots: bool,
    },
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    search: SearchOptions,
    explore: ExplorePlan,
    swarm: SwarmPlan,
    engine: EngineSection,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct EngineSection {
    command: Vec<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing(verbose: bool) {
    let directive = if verbose { "ace=debug" } else { "ace=info" };
    let mut filter = EnvFilter::from_default_env();
    if let Ok(d) = directive.parse() {
        filter = filter.add_directive(d);
    }
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run_command(cli: Cli) -> Result<Option<Value>> {
    let layout = Layout::new(&cli.root);
    let file = load_file_config(cli.config.as_deref(), &layout)?;
    match cli.command {
        Commands::Train {
            search,
            fast_lr,
            slow_lr,
            attempts,
            attempt_episodes,
            episodes,
        } => {
            let options = resolve_options(file.search, &search)?;
            let mut plan = file.explore;
            if let Some(v) = fast_lr {
                plan.fast_lr = v;
            }
            if let Some(v) = slow_lr {
                plan.slow_lr = v;
            }
            if let Some(v) = attempts {
                plan.num_attempts = v;
            }
            if let Some(v) = attempt_episodes {
                plan.attempt_length = v;
            }
            if let Some(v) = episodes {
                plan.train_episodes = v;
            }

            layout.prepare()?;
            let _lock = acquire_workspace_lock(&layout)?;
            let engine = build_engine(cli.engine.as_deref(), &file.engine, &layout)?;
            let store = layout.checkpoint_store(&options.checkpoint_suffix);
            let settings = layout.settings();
            let journal = Journal::create(
                &layout.runs_dir(),
                "train",
                json!({
                    "options": options,
                    "plan": plan,
                    "engine": engine.command(),
                    "engine_digest": engine.digest()?,
                }),
            )?;
            let trainer =
                Trainer::new(&engine, &store, &settings, options)?.with_journal(&journal);
            let report = trainer.train(&plan)?;
            journal.complete(serde_json::to_value(&report)?)?;
            info!(run_id = journal.run_id(), "training complete");

            if search.json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "train",
                    "run_id": journal.run_id(),
                    "run_dir": journal.dir().display().to_string(),
                    "report": report,
                })));
            }
            println!("run_id: {}", journal.run_id());
            println!("run_dir: {}", journal.dir().display());
            println!("explored: {}", report.explored);
            if let Some(idx) = report.winner_index {
                println!("exploration_winner: {}", idx);
            }
            println!("episodes: {}", report.losses.len());
            println!("final_score: {}", report.final_score);
        }
        Commands::Swarm {
            search,
            swarm_size,
            episodes,
            lr,
            perturbation,
            decay,
            iterations,
            explore_attempts,
            explore_episodes,
        } => {
            let options = resolve_options(file.search, &search)?;
            let mut plan = file.swarm;
            if let Some(v) = swarm_size {
                plan.swarm_size = v;
            }
            if let Some(v) = episodes {
                plan.num_episodes = v;
            }
            if let Some(v) = lr {
                plan.learning_rate = v;
            }
            if let Some(v) = perturbation {
                plan.initial_perturbation = v;
            }
            if let Some(v) = decay {
                plan.perturbation_decay = v;
            }
            if let Some(v) = iterations {
                plan.iterations = v;
            }
            if let Some(v) = explore_attempts {
                plan.exploratory_attempts = v;
            }
            if let Some(v) = explore_episodes {
                plan.exploratory_episodes = v;
            }

            layout.prepare()?;
            let _lock = acquire_workspace_lock(&layout)?;
            let engine = build_engine(cli.engine.as_deref(), &file.engine, &layout)?;
            let store = layout.checkpoint_store(&options.checkpoint_suffix);
            let settings = layout.settings();
            let journal = Journal::create(
                &layout.runs_dir(),
                "swarm",
                json!({
                    "options": options,
                    "plan": plan,
                    "engine": engine.command(),
                    "engine_digest": engine.digest()?,
                }),
            )?;
            let trainer =
                Trainer::new(&engine, &store, &settings, options)?.with_journal(&journal);
            let report = trainer.train_as_swarm(&plan)?;
            journal.complete(serde_json::to_value(&report)?)?;
            info!(run_id = journal.run_id(), "swarm complete");

            if search.json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "swarm",
                    "run_id": journal.run_id(),
                    "run_dir": journal.dir().display().to_string(),
                    "report": report,
                })));
            }
            println!("run_id: {}", journal.run_id());
            println!("run_dir: {}", journal.dir().display());
            println!("initial_target: {}", report.initial_target);
            for g in &report.generations {
                println!(
                    "generation {}: perturbation={:.6} target={} winner={} score={}",
                    g.generation + 1,
                    g.perturbation,
                    g.target_score,
                    g.winner_index,
                    g.score
                );
            }
            println!("best_score: {}", report.best_score);
        }
        Commands::Run { search } => {
            let options = resolve_options(file.search, &search)?;
            let episode_length = search.episode_length;
            layout.prepare()?;
            let _lock = acquire_workspace_lock(&layout)?;
            let engine = build_engine(cli.engine.as_deref(), &file.engine, &layout)?;
            let store = layout.checkpoint_store(&options.checkpoint_suffix);
            let settings = layout.settings();
            let policy = options.on_desync;
            let trainer = Trainer::new(&engine, &store, &settings, options)?;
            let ran = trainer.evaluate(episode_length)?;

            if search.json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "ran": ran,
                    "on_desync": policy.as_str(),
                })));
            }
            if ran {
                println!("run: completed");
            } else {
                println!("run: skipped (settings record out of sync, policy {})", policy.as_str());
            }
        }
        Commands::Describe {
            search,
            attempt_slots,
        } => {
            let options = resolve_options(file.search, &search)?;
            let base = options.base_config()?;
            let store = layout.checkpoint_store(&options.checkpoint_suffix);
            let settings = layout.settings();
            let description = describe_workspace(&store, &settings, &base, attempt_slots)?;

            if search.json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "root": layout.root().display().to_string(),
                    "settings_path": settings.path().display().to_string(),
                    "settings_digest": settings.digest()?,
                    "description": description,
                })));
            }
            println!("root: {}", layout.root().display());
            println!("settings: {}", settings.path().display());
            println!("settings_record: {}", description.settings_record.is_some());
            println!("synchronized: {}", description.synchronized);
            for field in &description.mismatched_fields {
                println!("  differs: {}", field);
            }
            for (slot, files) in &description.slots {
                println!("slot {}: {}", slot, files.join(", "));
            }
        }
        Commands::Init { force } => {
            layout.prepare()?;
            let path = layout.root().join(CONFIG_FILE);
            if path.exists() && !force {
                return Err(anyhow!(
                    "config_exists: {} (use --force to overwrite)",
                    path.display()
                ));
            }
            let mut template = FileConfig::default();
            template.engine.command = vec!["python".into(), "engine.py".into()];
            let yaml = serde_yaml::to_string(&template)?;
            std::fs::write(&path, yaml)
                .with_context(|| format!("write_failed: {}", path.display()))?;
            println!("wrote: {}", path.display());
            println!("next: edit engine.command in {}", path.display());
            println!("next: ace train --attempts 4");
        }
        Commands::Clean { runs, slots } => {
            for dir in clean_workspace(&layout, runs, slots)? {
                println!("removed: {}", dir.display());
            }
        }
    }
    Ok(None)
}

fn load_file_config(explicit: Option<&Path>, layout: &Layout) -> Result<FileConfig> {
    let path = match explicit {
        Some(p) => p.to_path_buf(),
        None => {
            let default = layout.root().join(CONFIG_FILE);
            if !default.exists() {
                return Ok(FileConfig::default());
            }
            default
        }
    };
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("config_read_failed: {}", path.display()))?;
    let parsed: FileConfig = serde_yaml::from_str(&raw)
        .with_context(|| format!("config_invalid: {}", path.display()))?;
    debug!(path = %path.display(), "loaded config file");
    Ok(parsed)
}

fn resolve_options(mut options: SearchOptions, args: &SearchArgs) -> Result<SearchOptions> {
    args.apply(&mut options)?;
    options.validate()?;
    Ok(options)
}

fn build_engine(
    flag: Option<&str>,
    section: &EngineSection,
    layout: &Layout,
) -> Result<ProcessEngine> {
    let command: Vec<String> = match flag {
        Some(raw) => raw.split_whitespace().map(str::to_string).collect(),
        None => section.command.clone(),
    };
    if command.is_empty() {
        return Err(anyhow!(
            "engine_missing: pass --engine or set engine.command in {}",
            CONFIG_FILE
        ));
    }
    ProcessEngine::new(command, layout.root(), layout.models_dir())
}

fn clean_workspace(layout: &Layout, runs: bool, slots: bool) -> Result<Vec<PathBuf>> {
    let _lock = acquire_workspace_lock(layout)?;
    let mut removed = Vec::new();
    if runs {
        let runs_dir = layout.runs_dir();
        if runs_dir.exists() {
            std::fs::remove_dir_all(&runs_dir)?;
            removed.push(runs_dir);
        }
    }
    if slots {
        for dir in slot_dirs(&layout.models_dir())? {
            std::fs::remove_dir_all(&dir)?;
            removed.push(dir);
        }
    }
    Ok(removed)
}

/// Host and attempt slot directories under the models directory.
fn slot_dirs(models_dir: &Path) -> Result<Vec<PathBuf>> {
    if !models_dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for entry in std::fs::read_dir(models_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        let is_attempt = name
            .strip_prefix("attempt")
            .map(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()))
            .unwrap_or(false);
        if name == "host" || is_attempt {
            out.push(entry.path());
        }
    }
    out.sort();
    Ok(out)
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Train { search, .. }
        | Commands::Swarm { search, .. }
        | Commands::Run { search }
        | Commands::Describe { search, .. } => search.json,
        _ => false,
    }
}

fn parse_set_bindings(values: &[String]) -> Result<BTreeMap<String, Value>> {
    let mut out = BTreeMap::new();
    for raw in values {
        let (key, val_raw) = raw
            .split_once('=')
            .ok_or_else(|| anyhow!("invalid --set '{}': expected k=v", raw))?;
        if key.trim().is_empty() {
            return Err(anyhow!("invalid --set '{}': key cannot be empty", raw));
        }
        let parsed =
            serde_json::from_str::<Value>(val_raw).unwrap_or(Value::String(val_raw.to_string()));
        out.insert(key.trim().to_string(), parsed);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_bindings_parse_json_values_with_string_fallback() {
        let parsed = parse_set_bindings(&[
            "trainingParams.hiddenSize=200".to_string(),
            "scenario.numPeople=12".to_string(),
            "tag=plain text".to_string(),
        ])
        .unwrap();
        assert_eq!(parsed["trainingParams.hiddenSize"], json!(200));
        assert_eq!(parsed["scenario.numPeople"], json!(12));
        assert_eq!(parsed["tag"], json!("plain text"));
        assert!(parse_set_bindings(&["novalue".to_string()]).is_err());
        assert!(parse_set_bindings(&["=3".to_string()]).is_err());
    }

    #[test]
    fn yaml_sections_are_optional_and_partial() {
        let parsed: FileConfig = serde_yaml::from_str(
            "search:\n  trial_episodes: 3\n  on_desync: proceed_anyway\nswarm:\n  swarm_size: 4\nengine:\n  command: [python, engine.py]\n",
        )
        .unwrap();
        assert_eq!(parsed.search.trial_episodes, 3);
        assert_eq!(parsed.search.on_desync, DesyncPolicy::ProceedAnyway);
        assert_eq!(parsed.search.num_persons, 48);
        assert_eq!(parsed.swarm.swarm_size, 4);
        assert_eq!(parsed.explore.train_episodes, 500);
        assert_eq!(parsed.engine.command, vec!["python", "engine.py"]);
        assert!(serde_yaml::from_str::<FileConfig>("bogus: 1\n").is_err());
    }

    #[test]
    fn flags_override_file_values() {
        let args = SearchArgs {
            persons: Some(10),
            firms: None,
            episode_length: None,
            trial_episodes: Some(2),
            trial_margin: None,
            seed: None,
            on_desync: Some(DesyncArg::Reload),
            set_values: vec!["trainingParams.hiddenSize=64".to_string()],
            json: false,
        };
        let file = SearchOptions {
            num_firms: 3,
            trial_episodes: 9,
            ..SearchOptions::default()
        };
        let options = resolve_options(file, &args).unwrap();
        assert_eq!(options.num_persons, 10);
        assert_eq!(options.num_firms, 3);
        assert_eq!(options.trial_episodes, 2);
        assert_eq!(options.on_desync, DesyncPolicy::ReloadThenProceed);
        assert_eq!(options.base_config().unwrap().training.hidden_size, 64);
    }

    #[test]
    fn engine_flag_wins_over_config_section() {
        let layout = Layout::new("/work");
        let section = EngineSection {
            command: vec!["python".into(), "engine.py".into()],
        };
        let engine = build_engine(Some("./bin/engine --fast"), &section, &layout).unwrap();
        assert_eq!(engine.command(), &["./bin/engine", "--fast"]);
        let engine = build_engine(None, &section, &layout).unwrap();
        assert_eq!(engine.command(), &["python", "engine.py"]);
        assert!(build_engine(None, &EngineSection::default(), &layout).is_err());
    }

    #[test]
    fn cli_parses_global_and_subcommand_flags() {
        let cli = Cli::try_parse_from([
            "ace",
            "--root",
            "/tmp/ws",
            "swarm",
            "--swarm-size",
            "4",
            "--on-desync",
            "proceed",
            "--set",
            "trainingParams.hiddenSize=50",
            "--json",
        ])
        .unwrap();
        assert_eq!(cli.root, PathBuf::from("/tmp/ws"));
        assert!(command_json_mode(&cli.command));
        match cli.command {
            Commands::Swarm {
                search, swarm_size, ..
            } => {
                assert_eq!(swarm_size, Some(4));
                assert!(matches!(search.on_desync, Some(DesyncArg::Proceed)));
                assert_eq!(search.set_values.len(), 1);
            }
            _ => panic!("expected swarm"),
        }
    }

    #[test]
    fn clean_waits_for_the_workspace_lock() {
        let root = std::env::temp_dir().join(format!(
            "ace_cli_clean_{}_{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        let layout = Layout::new(&root);
        layout.prepare().unwrap();
        let host = layout.models_dir().join("host");
        std::fs::create_dir_all(&host).unwrap();
        std::fs::create_dir_all(layout.models_dir().join("attempt3")).unwrap();
        std::fs::create_dir_all(layout.models_dir().join("attempts")).unwrap();

        let held = acquire_workspace_lock(&layout).unwrap();
        let err = clean_workspace(&layout, true, true).expect_err("lock is held");
        assert!(err.to_string().contains("workspace_busy"), "{}", err);
        assert!(host.is_dir());
        drop(held);

        let removed = clean_workspace(&layout, false, true).unwrap();
        assert_eq!(removed.len(), 2);
        assert!(!host.exists());
        assert!(layout.models_dir().join("attempts").is_dir());
        assert!(!layout.lock_path().exists());
        let _ = std::fs::remove_dir_all(&root);
    }
}
