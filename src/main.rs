use anyhow::Result;
use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use sitesmith::build::{build_site, check_site};
use sitesmith::config::Config;
use std::path::Path;

fn main() -> Result<()> {
    let directory = Arg::with_name("DIRECTORY")
        .help("The site directory (defaults to the current directory)")
        .index(1);
    let verbose = Arg::with_name("verbose")
        .short("v")
        .long("verbose")
        .help("Log every file as it is processed");

    let matches = App::new("sitesmith")
        .version(env!("CARGO_PKG_VERSION"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .subcommand(
            SubCommand::with_name("build")
                .about("Builds the site into its output directory")
                .arg(directory.clone())
                .arg(verbose.clone())
                .arg(
                    Arg::with_name("output")
                        .short("o")
                        .long("output")
                        .takes_value(true)
                        .value_name("DIR")
                        .help("Overrides the output directory"),
                ),
        )
        .subcommand(
            SubCommand::with_name("check")
                .about("Builds the site in memory and reports errors")
                .arg(directory)
                .arg(verbose),
        )
        .get_matches();

    match matches.subcommand() {
        ("build", Some(m)) => {
            init_logging(m);
            let config = load_config(m, m.value_of("output").map(Path::new))?;
            build_site(config)?;
        }
        ("check", Some(m)) => {
            init_logging(m);
            let pages = check_site(load_config(m, None)?)?;
            println!("{} files OK", pages);
        }
        _ => unreachable!(),
    }
    Ok(())
}

fn init_logging(matches: &ArgMatches) {
    let default = if matches.is_present("verbose") {
        "debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default.into()),
        )
        .with_target(false)
        .init();
}

fn load_config(matches: &ArgMatches, output: Option<&Path>) -> Result<Config> {
    let dir = Path::new(matches.value_of("DIRECTORY").unwrap_or("."));
    Config::from_directory(dir, output)
}
