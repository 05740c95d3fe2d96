use clap::{Arg, ArgAction, Command};
use log::debug;
use std::time::Instant;

pub const DEFAULT_CONFIG_PATH: &str = "config/camlapse.yaml";

pub fn build_cli() -> Command {
    debug!("⚙️ Building CLI interface...");
    let start_time = Instant::now();
    let cmd = Command::new("camlapse")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Snapshots and timelapses from a Raspberry Pi (or simulated) camera.")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Sets a custom configuration file")
                .action(ArgAction::Set)
        )
        .arg(
            Arg::new("debug")
                .short('d')
                .long("debug")
                .help("Enable debug logging")
                .action(ArgAction::SetTrue)
        )
        .subcommand(
            Command::new("snap")
                .about("Captures a single still image")
                .arg(Arg::new("output").short('o').long("output").value_name("FILE").help("Where to write the PNG (default: the snapshot directory)").action(ArgAction::Set))
        )
        .subcommand(
            Command::new("timelapse")
                .about("Runs a timelapse in the foreground; Ctrl-C cancels it")
                .arg(Arg::new("name").value_name("NAME").required(true).help("Name of the timelapse, also its directory name").action(ArgAction::Set))
                .arg(Arg::new("interval").short('i').long("interval").value_name("SECONDS").help("Seconds between frames").value_parser(clap::value_parser!(f64)).required_unless_present("timepoints").action(ArgAction::Set))
                .arg(Arg::new("count").short('n').long("count").value_name("FRAMES").help("Number of frames to capture").value_parser(clap::value_parser!(u32)).required_unless_present("timepoints").action(ArgAction::Set))
                .arg(Arg::new("timepoints").long("timepoints").value_name("CSV").help("File of capture offsets in seconds, instead of --interval/--count").conflicts_with_all(["interval", "count"]).action(ArgAction::Set))
                .arg(Arg::new("report-every").long("report-every").value_name("SECONDS").help("How often to log progress").value_parser(clap::value_parser!(u64)).default_value("10").action(ArgAction::Set))
        )
        .subcommand(
            Command::new("list")
                .about("Lists finished timelapses")
                .arg(Arg::new("page").long("page").value_name("N").help("Page number, starting at 1").value_parser(clap::value_parser!(usize)).default_value("1").action(ArgAction::Set))
                .arg(Arg::new("find").long("find").value_name("QUERY").help("Only show names containing QUERY").action(ArgAction::Set))
        )
        .subcommand(
            Command::new("delete")
                .about("Deletes a finished timelapse after confirmation")
                .arg(Arg::new("name").value_name("NAME").required(true).action(ArgAction::Set))
                .arg(Arg::new("yes").short('y').long("yes").help("Confirm without prompting").action(ArgAction::SetTrue))
        )
        .subcommand(
            Command::new("rename")
                .about("Renames a finished timelapse after confirmation")
                .arg(Arg::new("name").value_name("NAME").required(true).action(ArgAction::Set))
                .arg(Arg::new("new_name").value_name("NEW_NAME").required(true).action(ArgAction::Set))
                .arg(Arg::new("yes").short('y').long("yes").help("Confirm without prompting").action(ArgAction::SetTrue))
        )
        .subcommand(
            Command::new("export")
                .about("Writes a finished timelapse as a zip archive")
                .arg(Arg::new("name").value_name("NAME").required(true).action(ArgAction::Set))
                .arg(Arg::new("output").short('o').long("output").value_name("FILE").help("Archive path (default: NAME.zip)").action(ArgAction::Set))
        )
        .subcommand(
            Command::new("recover")
                .about("Moves interrupted timelapses out of the active area and lists them")
        )
        .subcommand(
            Command::new("camera-set")
                .about("Changes camera parameters and shows the change log")
                .arg(Arg::new("name").long("name").value_name("NAME").action(ArgAction::Set))
                .arg(Arg::new("width").long("width").value_name("PIXELS").value_parser(clap::value_parser!(u32)).action(ArgAction::Set))
                .arg(Arg::new("height").long("height").value_name("PIXELS").value_parser(clap::value_parser!(u32)).action(ArgAction::Set))
                .arg(Arg::new("exposure").long("exposure").value_name("MICROSECONDS").value_parser(clap::value_parser!(u32)).action(ArgAction::Set))
                .arg(Arg::new("gain").long("gain").value_name("GAIN").value_parser(clap::value_parser!(f32)).action(ArgAction::Set))
                .arg(Arg::new("snap").long("snap").help("Take a snapshot with the new settings").action(ArgAction::SetTrue))
        )
        .subcommand(
            Command::new("console")
                .about("Interactive console for snapshots and timelapses")
        );
    debug!("✅ CLI interface built in {:?}", start_time.elapsed());
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        build_cli().debug_assert();
    }

    #[test]
    fn timelapse_takes_interval_and_count_or_timepoints() {
        let matches = build_cli()
            .try_get_matches_from(["camlapse", "timelapse", "t1", "-i", "1.5", "-n", "3"])
            .unwrap();
        let (_, sub) = matches.subcommand().unwrap();
        assert_eq!(sub.get_one::<f64>("interval"), Some(&1.5));
        assert_eq!(sub.get_one::<u32>("count"), Some(&3));

        assert!(build_cli().try_get_matches_from(["camlapse", "timelapse", "t1"]).is_err());
        assert!(build_cli()
            .try_get_matches_from(["camlapse", "timelapse", "t1", "--timepoints", "tp.csv"])
            .is_ok());
    }
}
