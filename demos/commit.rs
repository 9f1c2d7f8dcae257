//! Commit the backing layer of a disk into its own base image.
//!
//! The active layer is left alone: committing it would need
//! `block-job-complete` once the job is ready.
//!
//! Usage: `cargo run --example commit -- <qmp-socket> <device> <job-id>`

use std::time::Duration;

use qmp_block::{Client, Endpoint, block};

#[tokio::main(flavor = "current_thread")]
async fn main() -> qmp_block::Result<()> {
    let mut args = std::env::args().skip(1);
    let socket = args
        .next()
        .unwrap_or_else(|| "/var/run/qemu-server/100.qmp".to_string());
    let device = args.next().unwrap_or_else(|| "drive-virtio-disk0".to_string());
    let job_id = args.next().unwrap_or_else(|| "commit-demo".to_string());

    let client = Client::connect(Endpoint::unix(socket)).await?;

    let Some(disk) = block::block_devices(&client)
        .await?
        .into_iter()
        .find(|d| d.device == device)
    else {
        eprintln!("no block device named {device}");
        return Ok(());
    };

    let Some(overlay) = disk.inserted.backing_file.clone() else {
        eprintln!("{device} has no backing file to commit");
        return Ok(());
    };
    println!("committing {overlay} below {}", disk.inserted.node_name);

    match disk
        .commit(&client, &overlay, &job_id, Duration::from_secs(600))
        .await
    {
        Ok(()) => println!("commit finished"),
        Err(e) if e.is_job_state_unknown() => {
            println!("commit outcome unknown ({e}); running jobs:");
            for job in block::block_jobs(&client).await? {
                println!("  {}", job.device);
            }
        }
        Err(e) => return Err(e),
    }

    Ok(())
}
