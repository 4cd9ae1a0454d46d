//! Hydrate / dehydrate round trips against a filesystem object store.

use devenv_core::VolumeRef;
use devenv_snapshot::{
    archive, hash_utils::sha256_hash, FsObjectStore, HydrationService, HydrationSource,
};
use std::fs;
use std::sync::Arc;
use tempfile::TempDir;

fn service(objects: &TempDir, volumes: &TempDir) -> HydrationService {
    HydrationService::new(
        Arc::new(FsObjectStore::new(objects.path())),
        volumes.path(),
        None,
    )
}

#[tokio::test]
async fn test_hydrate_dehydrate_hydrate_preserves_tree() {
    let objects = TempDir::new().unwrap();
    let volumes = TempDir::new().unwrap();
    let svc = service(&objects, &volumes);
    let volume = VolumeRef::for_project(42, 7);

    svc.hydrate(7, &volume).await.unwrap();
    let path = svc.volume_path(&volume);
    fs::create_dir_all(path.join("src/bin")).unwrap();
    fs::write(path.join("Cargo.toml"), "[package]\nname = \"demo\"\n").unwrap();
    fs::write(path.join("src/bin/tool.rs"), "fn main() {}\n").unwrap();
    fs::create_dir_all(path.join("target")).unwrap();

    let reference = TempDir::new().unwrap();
    fs::create_dir_all(reference.path().join("src/bin")).unwrap();
    fs::write(reference.path().join("Cargo.toml"), "[package]\nname = \"demo\"\n").unwrap();
    fs::write(reference.path().join("src/bin/tool.rs"), "fn main() {}\n").unwrap();
    fs::create_dir_all(reference.path().join("target")).unwrap();
    let expected = sha256_hash(&archive::pack(reference.path()).unwrap());

    let snapshot = svc.dehydrate(7, &volume).await.unwrap();
    assert_eq!(snapshot.content_hash, expected);
    assert_eq!(
        snapshot.key,
        format!("projects/7/snapshots/{expected}.tar.gz")
    );
    assert!(!path.exists(), "volume must be released after dehydrate");
    assert!(objects.path().join(&snapshot.key).is_file());

    let source = svc.hydrate(7, &volume).await.unwrap();
    assert_eq!(source, HydrationSource::Snapshot(snapshot.clone()));
    assert_eq!(
        fs::read_to_string(path.join("src/bin/tool.rs")).unwrap(),
        "fn main() {}\n"
    );
    assert!(path.join("target").is_dir());
    assert_eq!(
        sha256_hash(&archive::pack(&path).unwrap()),
        snapshot.content_hash
    );
}

#[tokio::test]
async fn test_projects_do_not_share_snapshots() {
    let objects = TempDir::new().unwrap();
    let volumes = TempDir::new().unwrap();
    let svc = service(&objects, &volumes);
    let first = VolumeRef::for_project(1, 10);
    let second = VolumeRef::for_project(1, 11);

    svc.hydrate(10, &first).await.unwrap();
    fs::write(svc.volume_path(&first).join("only-here"), "10").unwrap();
    svc.dehydrate(10, &first).await.unwrap();

    assert_eq!(
        svc.hydrate(11, &second).await.unwrap(),
        HydrationSource::Empty
    );
    assert!(!svc.volume_path(&second).join("only-here").exists());
}

#[tokio::test]
async fn test_dehydrate_missing_volume_is_not_found() {
    let objects = TempDir::new().unwrap();
    let volumes = TempDir::new().unwrap();
    let svc = service(&objects, &volumes);
    let err = svc
        .dehydrate(7, &VolumeRef::for_project(42, 7))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), devenv_core::ErrorKind::NotFound);
}
