use clap::Parser as _;
use std::process;

#[derive(clap::Parser)]
struct Arguments {
  #[clap(flatten)]
  arguments: chaff::Arguments,
  #[arg(long = "log-file", help = "Also log to this file")]
  pub log_file: Option<String>,
  #[clap(flatten)]
  verbose: clap_verbosity_flag::Verbosity<clap_verbosity_flag::WarnLevel>,
}

fn main() {
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
            .target(log4rs::append::console::Target::Stderr)
            .encoder(encoder.clone())
            .build(),
        ),
      ),
  );
  let mut root = log4rs::config::Root::builder().appender("console");
  if let Some(log_file) = &arguments.log_file {
    match log4rs::append::file::FileAppender::builder()
      .encoder(encoder)
      .build(log_file)
    {
      Ok(appender) => {
        config = config.appender(
          log4rs::config::Appender::builder()
            .filter(Box::new(log4rs::filter::threshold::ThresholdFilter::new(
              log::LevelFilter::Trace,
            )))
            .build("file", Box::new(appender)),
        );
        root = root.appender("file");
      }
      Err(error) => eprintln!("couldn't open log file {log_file}: {error}"),
    }
  }
  if let Err(error) = log4rs::init_config(
    config
      .build(root.build(log::LevelFilter::Trace))
      .expect("valid logging configuration"),
  ) {
    eprintln!("couldn't initialize logging: {error}");
  }

  match chaff::run(&arguments.arguments) {
    Ok(code) => process::exit(code),
    Err(error) => {
      log::error!("{error:#}");
      process::exit(chaff::EXIT_ERROR);
    }
  }
}
