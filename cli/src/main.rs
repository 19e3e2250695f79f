use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{arg, value_parser, ArgMatches, Command};
use recognition::paths::*;
use recognition::{
    Config, Deadline, DecisionEngine, FeatureExtractor, FeatureSet, FingerprintSample,
    FsTemplateStore, Matcher, RidgeExtractor, StoreError, TemplateStore, Verdict,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    if whoami::username() != "root" {
        warn!("not running as root; the template store is probably not writable");
    }

    create_config_dir()?;
    let config_file = get_config_file()?;
    let loaded = Config::load(&config_file, &[]);
    for warning in &loaded.warnings {
        warn!("{warning}");
    }
    let config = loaded.config;

    let matches = Command::new(env!("CARGO_PKG_NAME"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .version(env!("CARGO_PKG_VERSION"))
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(
            Command::new("add")
                .about("Enroll a fingerprint image for a user.")
                .arg(arg!(<USER> "Affected user").value_parser(value_parser!(String)))
                .arg(
                    arg!(<IMAGE> "Fingerprint image (PNG or PGM)")
                        .value_parser(value_parser!(PathBuf)),
                )
                .arg(
                    arg!(-f --finger <N> "Finger index, 0-9")
                        .value_parser(value_parser!(u8).range(0..10))
                        .default_value("0"),
                )
                .arg_required_else_help(true),
        )
        .subcommand(
            Command::new("list")
                .about("List enrolled templates of a user.")
                .arg(arg!(<USER> "Affected user").value_parser(value_parser!(String)))
                .arg_required_else_help(true),
        )
        .subcommand(
            Command::new("test")
                .about("Verify a fingerprint image against a user's templates.")
                .arg(arg!(<USER> "Affected user").value_parser(value_parser!(String)))
                .arg(
                    arg!(<IMAGE> "Fingerprint image (PNG or PGM)")
                        .value_parser(value_parser!(PathBuf)),
                )
                .arg_required_else_help(true),
        )
        .subcommand(
            Command::new("remove")
                .about("Delete every template of a user.")
                .arg(arg!(<USER> "Affected user").value_parser(value_parser!(String)))
                .arg_required_else_help(true),
        )
        .get_matches();

    let result = match matches.subcommand() {
        Some(("add", sub)) => cmd_add(&config, sub),
        Some(("list", sub)) => cmd_list(&config, sub),
        Some(("test", sub)) => cmd_test(&config, sub),
        Some(("remove", sub)) => cmd_remove(&config, sub),
        _ => unreachable!(),
    };

    if let Err(err) = result {
        println!("Command failed with:\n{:#}", err);
        std::process::exit(1);
    }

    Ok(())
}

fn user(matches: &ArgMatches) -> Result<&str> {
    matches
        .get_one::<String>("USER")
        .map(String::as_str)
        .context("missing user")
}

fn features_from(config: &Config, matches: &ArgMatches) -> Result<FeatureSet> {
    let image = matches
        .get_one::<PathBuf>("IMAGE")
        .context("missing image")?;
    let capture = &config.capture;
    let sample =
        FingerprintSample::open_within(image, capture.dpi, capture.max_width, capture.max_height)
            .with_context(|| format!("could not read {}", image.display()))?;
    let deadline = Deadline::after(config.policy.timeout());
    let features = RidgeExtractor::new(config.extraction.clone())
        .extract(&sample, &deadline)
        .with_context(|| format!("no usable fingerprint in {}", image.display()))?;
    info!(
        points = features.len(),
        quality = features.quality(),
        "extracted features"
    );
    Ok(features)
}

fn cmd_add(config: &Config, matches: &ArgMatches) -> Result<()> {
    let user = user(matches)?;
    let finger = matches.get_one::<u8>("finger").copied().unwrap_or(0);
    let features = features_from(config, matches)?;

    let store = FsTemplateStore::from_config(&config.store);
    create_data_dir(store.root())?;
    let existing = match store.load_templates(user, &Deadline::unbounded()) {
        Ok(loaded) => loaded.templates.len(),
        Err(StoreError::NotEnrolled(_)) => 0,
        Err(err) => return Err(err.into()),
    };
    if existing >= config.store.max_templates_per_identity {
        bail!(
            "{user} already has {existing} templates, the configured maximum; remove some first"
        );
    }

    let template = store.save_template(user, finger, features)?;
    println!(
        "Enrolled template {} for {user} ({} minutiae).",
        template.id(),
        template.features().len()
    );
    Ok(())
}

fn cmd_list(config: &Config, matches: &ArgMatches) -> Result<()> {
    let user = user(matches)?;
    let store = FsTemplateStore::from_config(&config.store);
    let loaded = match store.load_templates(user, &Deadline::unbounded()) {
        Ok(loaded) => loaded,
        Err(StoreError::NotEnrolled(_)) => {
            println!("{user} has no enrolled templates.");
            return Ok(());
        }
        Err(err) => return Err(err.into()),
    };

    for template in &loaded.templates {
        println!(
            "{}\tfinger {}\t{} minutiae\tenrolled {}",
            template.id(),
            template.finger(),
            template.features().len(),
            template.enrolled_at().format("%Y-%m-%d %H:%M:%S")
        );
    }
    if loaded.skipped > 0 {
        println!("{} unreadable record(s) skipped.", loaded.skipped);
    }
    Ok(())
}

fn cmd_test(config: &Config, matches: &ArgMatches) -> Result<()> {
    let user = user(matches)?;
    let store = FsTemplateStore::from_config(&config.store);
    let loaded = store.load_templates(user, &Deadline::unbounded())?;
    let features = features_from(config, matches)?;

    let engine = DecisionEngine::new(
        Matcher::new(config.matching.clone()),
        config.matching.threshold,
        config.store.max_templates_per_identity,
    );
    let deadline = Deadline::after(config.policy.timeout());
    match engine.decide(&features, &loaded.templates, &deadline) {
        Verdict::Accept { template, score, .. } => println!(
            "Match: template {template}, score {:.3} ({} points paired).",
            score.score, score.matched
        ),
        Verdict::Reject { best } => println!(
            "No match: best score {:.3}, threshold {:.3}.",
            best.map_or(0.0, |s| s.score),
            engine.threshold()
        ),
        Verdict::Inconclusive { kind } => bail!("verification inconclusive: {kind}"),
    }
    Ok(())
}

fn cmd_remove(config: &Config, matches: &ArgMatches) -> Result<()> {
    let user = user(matches)?;
    let removed = FsTemplateStore::from_config(&config.store).remove_templates(user)?;
    println!("Removed {removed} template(s) of {user}.");
    Ok(())
}
