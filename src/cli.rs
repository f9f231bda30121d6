use clap::Clap;

#[derive(Clap, Debug)]
pub struct LoggingOpts {
    /// A level of verbosity, and can be used multiple times
    #[clap(short, long, parse(from_occurrences), group = "logging")]
    pub verbose: u64,

    /// Enable all logging
    #[clap(short, long, group = "logging")]
    pub debug: bool,

    /// Disable everything but error logging
    #[clap(short, long, group = "logging")]
    pub error: bool,
}

#[derive(Clap, Debug)]
#[clap(author, about, version)]
pub struct AgentOpts {
    #[clap(flatten)]
    pub args: WatcherArgs,
    #[clap(flatten)]
    pub logging_opts: LoggingOpts,
}

/// CLI surface of the agent (section 6).
#[derive(Clap, Debug)]
pub struct WatcherArgs {
    /// Template file path for filebeat
    #[clap(long = "path.template")]
    pub template: String,

    /// Filebeat home path
    #[clap(long = "path.filebeat-home")]
    pub filebeat_home: String,

    /// Directory which mount host path
    #[clap(long = "path.base", default_value = "/")]
    pub base: String,

    /// Logs path
    #[clap(long = "path.logs", default_value = "")]
    pub logs: String,

    /// Log prefix of the env parameters. Multiple prefixes separated by ","
    #[clap(long = "logPrefix", default_value = "caicloud")]
    pub log_prefix: String,

    #[clap(long = "logLevel", default_value = "info")]
    pub log_level: String,

    /// Comma-separated namespace whitelist; if non-empty only these namespaces are collected.
    #[clap(long = "namespace.whitelist", default_value = "")]
    pub namespace_whitelist: String,

    /// Comma-separated namespace blacklist; membership always excludes.
    #[clap(long = "namespace.blacklist", default_value = "")]
    pub namespace_blacklist: String,

    #[clap(long = "log.maxSize", default_value = "10485760")]
    pub log_max_size: u64,

    #[clap(long = "log.maxBackups", default_value = "7")]
    pub log_max_backups: u64,

    /// Log to stderr
    #[clap(short = 'e', long)]
    pub log_to_stderr: bool,
}

#[derive(Clap, Debug)]
#[clap(author, about, version)]
pub struct KeeperOpts {
    #[clap(flatten)]
    pub logging_opts: LoggingOpts,

    /// Path to the filebeat.yml.tpl template used to render the shipper's root config.
    #[clap(long = "path.template", default_value = "/etc/filebeat/filebeat.yml.tpl")]
    pub template: String,

    /// Extra arguments forwarded verbatim to the supervised filebeat process,
    /// the analogue of the original keeper's `os.Args[1:]` passthrough.
    #[clap(last = true)]
    pub filebeat_args: Vec<String>,
}
