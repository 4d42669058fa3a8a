use clap::Parser;
use crust_fds::criu::cr_restore::{collect_fds, prepare_shared_fdinfo, restore_files};
use crust_fds::criu::log::log_init;
use crust_fds::criu::options::{opts, opts_init, FdRestoreOpts};
use crust_fds::images::ImageDir;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "crust-fds")]
#[command(about = "restore shared file descriptors of checkpointed tasks", long_about = None)]
struct Args {
    /// Path to the checkpoint image directory
    #[arg(short = 'D', long, value_name = "DIR")]
    image_dir: PathBuf,

    /// Restore pids, in fork order
    #[arg(short, long = "pid", value_name = "PID", required = true)]
    pids: Vec<i32>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Only collect and show the fd sharing table
    #[arg(long)]
    parse_only: bool,

    /// Fixed capacity of the shared fdinfo table (sized from images if unset)
    #[arg(long, value_name = "N")]
    capacity: Option<usize>,

    /// Abstract socket name prefix for the fd transport
    #[arg(long, value_name = "NAME", default_value = "crust-fd")]
    transport_prefix: String,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    log_init(args.verbose);

    let fd_opts = FdRestoreOpts {
        image_dir: args.image_dir,
        fdinfo_capacity: args.capacity,
        transport_prefix: args.transport_prefix,
        verbose: args.verbose,
    };
    fd_opts.validate()?;

    opts_init(fd_opts).map_err(|_| anyhow::anyhow!("options already initialized"))?;
    let opts = opts();

    log::info!("Running fd restore");
    log::info!("Image directory: {}", opts.image_dir.display());

    if args.parse_only {
        let img = ImageDir::open(&opts.image_dir)?;
        let mut table = prepare_shared_fdinfo(opts, &img, &args.pids)?;
        collect_fds(&mut table, &img, &args.pids)?;
        table.show();
        log::info!("Parse-only mode: skipping restore");
        return Ok(());
    }

    restore_files(opts, &args.pids)?;

    log::info!("Fd restore complete");

    Ok(())
}
