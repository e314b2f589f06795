use clap::{Parser, Subcommand};
use std::path::PathBuf;

use upgrade_builder::workflows::{
    create_upgrade, extract_repo, ostree_delta, ostree_upgrade, repo_info,
};
use upgrade_builder::UpgradeError;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Diff two wic images into <tag>-field-upgradeupdate.tar.gz (needs root)
    CreateUpgrade {
        /// Currently deployed image
        old_image: PathBuf,
        /// Image to upgrade to
        new_image: PathBuf,
        /// Artifact name prefix
        #[arg(long, default_value = "latest")]
        tag: String,
        /// Directory the artifact is written to
        #[arg(long, default_value = ".")]
        output_dir: PathBuf,
        /// Overwrite an existing artifact
        #[arg(long)]
        force: bool,
    },
    /// Single-file OSTree delta between the repos inside two wic images (needs root)
    CreateOstreeUpgrade {
        /// '<first-image> <new-image> <output>', or '<new-image> <output>' with --empty
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        /// Full delta from a null baseline instead of a base image
        #[arg(long)]
        empty: bool,
        /// Overwrite an existing output file
        #[arg(long)]
        force: bool,
    },
    /// Static delta between two commits of an on-disk repository
    OstreeDelta {
        /// Initial (deployed) repo
        #[arg(long, value_name = "DIR")]
        repo: PathBuf,
        /// Output folder; created if necessary
        #[arg(long, value_name = "DIR")]
        output: PathBuf,
        /// New (update) repo
        #[arg(long, value_name = "DIR")]
        update_repo: Option<PathBuf>,
        /// Machine (and therefore ref) being worked on
        #[arg(long)]
        machine: Option<String>,
        /// Sha of the tip of the delta image
        #[arg(long)]
        to_sha: Option<String>,
        /// Sha of the base of the delta image
        #[arg(long)]
        from_sha: Option<String>,
        /// Create a clean (full) static delta
        #[arg(long)]
        empty: bool,
        /// Name the artifact data.bin instead of data.tar.gz
        #[arg(long)]
        generate_bin: bool,
        /// Overwrite an existing artifact
        #[arg(long)]
        force: bool,
    },
    /// Extract the OSTree repository out of a wic image (needs root)
    ExtractRepo {
        /// Image to extract from
        image: PathBuf,
        /// Directory to populate
        repo_name: PathBuf,
        /// Replace the directory if it exists
        #[arg(long)]
        force: bool,
    },
    /// Print machine ref, head commit and commit log of a repository as JSON
    RepoInfo {
        #[arg(long, value_name = "DIR")]
        repo: PathBuf,
        #[arg(long)]
        machine: Option<String>,
    },
}

fn main() {
    let args = Args::parse();
    if let Err(err) = run(args) {
        eprintln!("error: {:#}", err);
        std::process::exit(exit_code_for(&err));
    }
}

fn run(args: Args) -> anyhow::Result<()> {
    match args.cmd {
        Command::CreateUpgrade {
            old_image,
            new_image,
            tag,
            output_dir,
            force,
        } => create_upgrade::run(&create_upgrade::CreateUpgradeOpts {
            old_image,
            new_image,
            tag,
            output_dir,
            force,
        }),
        Command::CreateOstreeUpgrade { paths, empty, force } => {
            ostree_upgrade::run(&ostree_upgrade::OsTreeUpgradeOpts { empty, paths, force })
        }
        Command::OstreeDelta {
            repo,
            output,
            update_repo,
            machine,
            to_sha,
            from_sha,
            empty,
            generate_bin,
            force,
        } => ostree_delta::run(&ostree_delta::OsTreeDeltaOpts {
            repo,
            output,
            update_repo,
            machine,
            to_sha,
            from_sha,
            empty,
            generate_bin,
            force,
        }),
        Command::ExtractRepo {
            image,
            repo_name,
            force,
        } => extract_repo::run(&extract_repo::ExtractRepoOpts {
            image,
            dest: repo_name,
            force,
        }),
        Command::RepoInfo { repo, machine } => {
            repo_info::run(&repo_info::RepoInfoOpts { repo, machine })
        }
    }
}

/// Map the first classified error in the chain to its exit code.
fn exit_code_for(err: &anyhow::Error) -> i32 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<UpgradeError>())
        .map(UpgradeError::exit_code)
        .unwrap_or(1)
}
