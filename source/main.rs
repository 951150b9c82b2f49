use clap::Parser as _;
use std::process;

#[derive(clap::Parser)]
#[command(name = "tandem", about = "Synchronize IMAP and Maildir mail stores")]
struct Arguments {
  #[clap(flatten)]
  arguments: tandem::Arguments,
  #[arg(long = "log-file", help = "Also log (verbosely) to this file")]
  pub log_file: Option<String>,
  #[clap(flatten)]
  verbose: clap_verbosity_flag::Verbosity<clap_verbosity_flag::InfoLevel>,
}

fn main() -> process::ExitCode {
  let arguments = Arguments::parse();

  let encoder = Box::new(log4rs::encode::pattern::PatternEncoder::new(
    "{d(%F %T)} {l} {t} - {m}{n}",
  ));
  let mut config = log4rs::config::Config::builder().appender(
    log4rs::config::Appender::builder()
      .filter(Box::new(log4rs::filter::threshold::ThresholdFilter::new(
        arguments.verbose.log_level_filter(),
      )))
      .build(
        "console",
        Box::new(
          log4rs::append::console::ConsoleAppender::builder()
            .encoder(encoder.clone())
            .build(),
        ),
      ),
  );
  let mut root = log4rs::config::Root::builder().appender("console");
  if let Some(log_file) = &arguments.log_file {
    config = config.appender(
      log4rs::config::Appender::builder()
        .filter(Box::new(log4rs::filter::threshold::ThresholdFilter::new(
          log::LevelFilter::Trace,
        )))
        .build(
          "file",
          Box::new(
            log4rs::append::file::FileAppender::builder()
              .encoder(encoder)
              .build(log_file)
              .expect("cannot open log file"),
          ),
        ),
    );
    root = root.appender("file");
  }
  log4rs::init_config(config.build(root.build(log::LevelFilter::Trace)).expect("log config"))
    .expect("log init");

  match tandem::run(&arguments.arguments) {
    Ok(code) => process::ExitCode::from(code),
    Err(error) => {
      log::error!("{error:#}");
      process::ExitCode::from(1)
    }
  }
}
