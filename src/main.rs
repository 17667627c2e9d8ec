use clap::Parser;
use colordesc::Opts;
use colordesc::cli::SubCommandExtend;
use colordesc::config::SubCommand;
use env_logger::Env;

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let opts = Opts::parse();
    match &opts.subcmd {
        SubCommand::Train(cmd) => cmd.run(&opts),
        SubCommand::Quantize(cmd) => cmd.run(&opts),
        SubCommand::Extract(cmd) => cmd.run(&opts),
        SubCommand::Kinds(cmd) => cmd.run(&opts),
    }
}
