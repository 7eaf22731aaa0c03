use std::path::PathBuf;

use anyhow::{bail, Error};

use b2s_datastore::snapshot::SnapshotManager;

fn run() -> Result<(), Error> {
    let root: PathBuf = match std::env::args().nth(1) {
        Some(path) => path.into(),
        None => bail!("no snapshot root passed!\n\nusage: ls-snapshots <snapshot-root> <subvolume-name>"),
    };
    let subvol_name = match std::env::args().nth(2) {
        Some(name) => name,
        None => bail!("no subvolume name passed!\n\nusage: ls-snapshots <snapshot-root> <subvolume-name>"),
    };

    let manager = SnapshotManager::new(root);
    for snapshot in manager.list(&subvol_name)? {
        println!("{}\t{}\t{:?}", snapshot.name(), snapshot.path, snapshot.kind);
    }

    Ok(())
}

fn main() {
    std::process::exit(match run() {
        Ok(_) => 0,
        Err(err) => {
            eprintln!("error: {}", err);
            1
        }
    });
}
