//! CLI Tests

#[cfg(test)]
mod tests {
    use crate::cli::{Cli, CliError, Commands, parse_level};
    use clap::Parser;
    use flowtest_core::ResponseMode;
    use std::error::Error;
    use std::path::PathBuf;
    use tracing::Level;

    /// Test CliError display implementations
    #[test]
    fn test_cli_error_display() {
        let error = CliError::ConnectionFailed("HTTP 401: bad key".to_string());
        assert_eq!(
            format!("{}", error),
            "Connection check failed: HTTP 401: bad key"
        );

        let error = CliError::RunFailed("client factory failed".to_string());
        assert_eq!(
            format!("{}", error),
            "Run ended with an error: client factory failed"
        );
        assert!(error.source().is_none());
    }

    /// Test run command with defaults
    #[test]
    fn test_parse_run_defaults() {
        let cli = Cli::try_parse_from(["flowtest", "run", "cases.json"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("flowtest.yaml"));
        assert!(!cli.verbose);

        let Commands::Run(args) = cli.command else {
            panic!("expected run command");
        };
        assert_eq!(args.cases, PathBuf::from("cases.json"));
        assert!(args.output.is_none());
        assert!(args.mode.is_none());
        assert!(!args.interactive);
        assert!(!args.quiet);
    }

    /// Test run command with every option
    #[test]
    fn test_parse_run_options() {
        let cli = Cli::try_parse_from([
            "flowtest",
            "run",
            "cases.json",
            "-o",
            "out/result.jsonl",
            "--mode",
            "blocking",
            "--interactive",
            "-c",
            "custom.yaml",
            "-v",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("custom.yaml"));
        assert!(cli.verbose);

        let Commands::Run(args) = cli.command else {
            panic!("expected run command");
        };
        assert_eq!(args.output, Some(PathBuf::from("out/result.jsonl")));
        assert_eq!(args.mode, Some(ResponseMode::Blocking));
        assert!(args.interactive);
    }

    /// Test invalid response mode is rejected by the parser
    #[test]
    fn test_parse_rejects_unknown_mode() {
        let err = Cli::try_parse_from(["flowtest", "run", "cases.json", "--mode", "push"])
            .unwrap_err();
        assert!(err.to_string().contains("push"));
    }

    /// Test run requires a case file
    #[test]
    fn test_parse_run_requires_cases() {
        assert!(Cli::try_parse_from(["flowtest", "run"]).is_err());
    }

    /// Test ping and check-config subcommands
    #[test]
    fn test_parse_other_commands() {
        let cli = Cli::try_parse_from(["flowtest", "ping", "--mode", "streaming"]).unwrap();
        let Commands::Ping(args) = cli.command else {
            panic!("expected ping command");
        };
        assert_eq!(args.mode, Some(ResponseMode::Streaming));

        let cli = Cli::try_parse_from(["flowtest", "-c", "a.yaml", "check-config"]).unwrap();
        assert!(matches!(cli.command, Commands::CheckConfig));
        assert_eq!(cli.config, PathBuf::from("a.yaml"));
    }

    /// Test log level parsing
    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("info").unwrap(), Level::INFO);
        assert_eq!(parse_level(" DEBUG ").unwrap(), Level::DEBUG);
        assert!(matches!(parse_level("loud"), Err(CliError::Logging(_))));
    }
}
