mod common;

use common::*;
use krin::db::fileset::MoveSpec;
use krin::error::ServerError;
use wire::{delete_type, AddAlbumParams, Set, ShareAlbumParams, SharingKey};

fn add_album(db: &krin::db::Db, owner: u64, album_id: &str) {
    db.add_album(
        owner,
        &AddAlbumParams {
            album_id: album_id.to_string(),
            date_created: 0,
            date_modified: 0,
            enc_private_key: "epk".to_string(),
            metadata: "md".to_string(),
            public_key: "apk".to_string(),
        },
    )
    .unwrap();
}

fn share(db: &krin::db::Db, actor: u64, album_id: &str, perms: &str, members: &[u64]) {
    db.share_album(
        actor,
        &ShareAlbumParams {
            album_id: album_id.to_string(),
            permissions: perms.to_string(),
            keys: members
                .iter()
                .map(|&user_id| SharingKey {
                    user_id,
                    enc_album_key: format!("sealed-for-{}", user_id),
                })
                .collect(),
        },
    )
    .unwrap();
}

fn mv(
    from: (Set, Option<&str>),
    to: (Set, Option<&str>),
    moving: bool,
    names: &[&str],
    headers: &[&str],
) -> MoveSpec {
    MoveSpec {
        set_from: from.0,
        album_id_from: from.1.map(str::to_string),
        set_to: to.0,
        album_id_to: to.1.map(str::to_string),
        is_moving: moving,
        filenames: names.iter().map(|s| s.to_string()).collect(),
        headers: headers.iter().map(|s| s.to_string()).collect(),
    }
}

// Create at t=1000, share at t=2000 with full permissions, unshare at
// t=3000: a member catching up from 1000 sees exactly one unshare
// tombstone and no live album.
#[test]
fn share_then_unshare_leaves_only_a_tombstone() {
    let (_dir, db) = test_db();
    let auth = auth_service(db.clone());
    let alice = new_account(&auth, "alice@example.com", "pw-a").user_id;
    let bob = new_account(&auth, "bob@example.com", "pw-b").user_id;
    let carol = new_account(&auth, "carol@example.com", "pw-c").user_id;

    db.set_time_for_testing(Some(1000));
    add_album(&db, alice, "album");

    db.set_time_for_testing(Some(2000));
    share(&db, alice, "album", "1111", &[bob, carol]);
    assert_eq!(db.album_updates(bob, 1000).unwrap().len(), 1);

    db.set_time_for_testing(Some(3000));
    db.unshare_album(alice, "album").unwrap();

    let (deletes, out_of_sync) = db.delete_updates(bob, 1000).unwrap();
    assert!(!out_of_sync);
    assert_eq!(deletes.len(), 1);
    assert_eq!(deletes[0].album_id, "album");
    assert_eq!(deletes[0].kind, delete_type::UNSHARE);
    assert_eq!(deletes[0].date, 3000);

    assert!(db.album_updates(bob, 0).unwrap().is_empty());

    // The owner still has the album, now unshared.
    let albums = db.album_updates(alice, 0).unwrap();
    assert_eq!(albums.len(), 1);
    assert_eq!(albums[0].is_shared, "0");
}

// Copy-out is permitted, removal is owner-only.
#[test]
fn member_can_copy_but_not_remove() {
    let (_dir, db) = test_db();
    let auth = auth_service(db.clone());
    let alice = new_account(&auth, "alice@example.com", "pw-a").user_id;
    let bob = new_account(&auth, "bob@example.com", "pw-b").user_id;

    db.set_time_for_testing(Some(1000));
    add_album(&db, alice, "album");
    // add=0, share=0, copy=1
    share(&db, alice, "album", "1001", &[bob]);

    add_gallery_file(&db, alice, "photo", 10);
    db.move_file(
        alice,
        &mv(
            (Set::Gallery, None),
            (Set::Album, Some("album")),
            true,
            &["photo"],
            &["hdr-album"],
        ),
    )
    .unwrap();

    // Copy out succeeds.
    db.move_file(
        bob,
        &mv(
            (Set::Album, Some("album")),
            (Set::Gallery, None),
            false,
            &["photo"],
            &["hdr-bob"],
        ),
    )
    .unwrap();
    assert_eq!(db.file_updates(bob, Set::Gallery, 0).unwrap().len(), 1);

    // Removal fails and the album is untouched.
    let err = db
        .move_file(
            bob,
            &mv(
                (Set::Album, Some("album")),
                (Set::Gallery, None),
                true,
                &["photo"],
                &["hdr-bob"],
            ),
        )
        .unwrap_err();
    match err {
        ServerError::Denied(msg) => {
            assert_eq!(msg, "Removing items from this album is not permitted")
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(db.file_updates(alice, Set::Album, 0).unwrap().len(), 1);
}

// A member without the add permission cannot push files in.
#[test]
fn member_without_add_cannot_insert() {
    let (_dir, db) = test_db();
    let auth = auth_service(db.clone());
    let alice = new_account(&auth, "alice@example.com", "pw-a").user_id;
    let bob = new_account(&auth, "bob@example.com", "pw-b").user_id;

    add_album(&db, alice, "album");
    share(&db, alice, "album", "1001", &[bob]);
    add_gallery_file(&db, bob, "bobpic", 5);

    let err = db
        .move_file(
            bob,
            &mv(
                (Set::Gallery, None),
                (Set::Album, Some("album")),
                false,
                &["bobpic"],
                &["h"],
            ),
        )
        .unwrap_err();
    assert!(matches!(err, ServerError::Denied(_)));
}

// Files in the trash only ever move back to the gallery.
#[test]
fn trash_is_one_way() {
    let (_dir, db) = test_db();
    let auth = auth_service(db.clone());
    let alice = new_account(&auth, "alice@example.com", "pw-a").user_id;
    add_album(&db, alice, "album");
    add_gallery_file(&db, alice, "pic", 10);

    db.move_file(
        alice,
        &mv((Set::Gallery, None), (Set::Trash, None), true, &["pic"], &[]),
    )
    .unwrap();

    // Copying out of the trash is rejected.
    assert!(db
        .move_file(
            alice,
            &mv((Set::Trash, None), (Set::Gallery, None), false, &["pic"], &[]),
        )
        .is_err());

    // Moving into an album is rejected.
    assert!(db
        .move_file(
            alice,
            &mv(
                (Set::Trash, None),
                (Set::Album, Some("album")),
                true,
                &["pic"],
                &["h"],
            ),
        )
        .is_err());

    // Trash -> gallery with isMoving succeeds.
    db.move_file(
        alice,
        &mv((Set::Trash, None), (Set::Gallery, None), true, &["pic"], &[]),
    )
    .unwrap();
    assert_eq!(db.file_updates(alice, Set::Gallery, 0).unwrap().len(), 1);
    assert!(db.file_updates(alice, Set::Trash, 0).unwrap().is_empty());
}

#[test]
fn file_updates_cursor_is_monotonic() {
    let (_dir, db) = test_db();
    let auth = auth_service(db.clone());
    let alice = new_account(&auth, "alice@example.com", "pw").user_id;

    db.set_time_for_testing(Some(1000));
    add_gallery_file(&db, alice, "one", 1);
    db.set_time_for_testing(Some(2000));
    add_gallery_file(&db, alice, "two", 1);

    let all = db.file_updates(alice, Set::Gallery, 0).unwrap();
    assert_eq!(all.len(), 2);
    let max = all.iter().map(|f| f.date_modified).max().unwrap();

    let newer = db.file_updates(alice, Set::Gallery, 1000).unwrap();
    assert_eq!(newer.len(), 1);
    assert_eq!(newer[0].file, "two");

    assert!(db.file_updates(alice, Set::Gallery, max).unwrap().is_empty());
}

// Space accounting counts each blob once and a violating call changes
// nothing.
#[test]
fn quota_is_enforced_and_atomic() {
    let (_dir, db) = test_db();
    let auth = auth_service(db.clone());
    let alice = new_account(&auth, "alice@example.com", "pw").user_id;
    db.edit_quota(alice, Some(100)).unwrap();

    add_gallery_file(&db, alice, "a", 60);
    assert_eq!(db.space_used(alice).unwrap(), 60);

    let err = db
        .add_file(
            alice,
            Set::Gallery,
            None,
            "b",
            file_spec("b", 50),
        )
        .unwrap_err();
    assert!(matches!(err, ServerError::QuotaExceeded));
    assert_eq!(db.space_used(alice).unwrap(), 60);
    assert_eq!(db.file_updates(alice, Set::Gallery, 0).unwrap().len(), 1);

    // Moving to trash does not change usage; the blob is still reachable.
    db.move_file(
        alice,
        &mv((Set::Gallery, None), (Set::Trash, None), true, &["a"], &[]),
    )
    .unwrap();
    assert_eq!(db.space_used(alice).unwrap(), 60);
}

// Copies into a shared album count against the album owner.
#[test]
fn copy_into_shared_album_charges_the_owner() {
    let (_dir, db) = test_db();
    let auth = auth_service(db.clone());
    let alice = new_account(&auth, "alice@example.com", "pw-a").user_id;
    let bob = new_account(&auth, "bob@example.com", "pw-b").user_id;

    add_album(&db, alice, "album");
    share(&db, alice, "album", "1101", &[bob]); // add=1, copy=1

    db.edit_quota(alice, Some(10)).unwrap();
    add_gallery_file(&db, bob, "big", 50);

    let err = db
        .move_file(
            bob,
            &mv(
                (Set::Gallery, None),
                (Set::Album, Some("album")),
                false,
                &["big"],
                &["h"],
            ),
        )
        .unwrap_err();
    assert!(matches!(err, ServerError::QuotaExceeded));

    db.edit_quota(alice, Some(1000)).unwrap();
    db.move_file(
        bob,
        &mv(
            (Set::Gallery, None),
            (Set::Album, Some("album")),
            false,
            &["big"],
            &["h"],
        ),
    )
    .unwrap();
    assert_eq!(db.space_used(alice).unwrap(), 50);
}

// Unknown filenames are skipped so retries are idempotent.
#[test]
fn move_skips_missing_files() {
    let (_dir, db) = test_db();
    let auth = auth_service(db.clone());
    let alice = new_account(&auth, "alice@example.com", "pw").user_id;
    add_gallery_file(&db, alice, "present", 1);

    db.move_file(
        alice,
        &mv(
            (Set::Gallery, None),
            (Set::Trash, None),
            true,
            &["present", "ghost"],
            &[],
        ),
    )
    .unwrap();
    assert_eq!(db.file_updates(alice, Set::Trash, 0).unwrap().len(), 1);

    // Retrying the same move is a no-op.
    db.move_file(
        alice,
        &mv(
            (Set::Gallery, None),
            (Set::Trash, None),
            true,
            &["present", "ghost"],
            &[],
        ),
    )
    .unwrap();
}

#[test]
fn empty_trash_advances_the_floor() {
    let (_dir, db) = test_db();
    let auth = auth_service(db.clone());
    let alice = new_account(&auth, "alice@example.com", "pw").user_id;

    db.set_time_for_testing(Some(1000));
    add_gallery_file(&db, alice, "old", 1);
    db.move_file(
        alice,
        &mv((Set::Gallery, None), (Set::Trash, None), true, &["old"], &[]),
    )
    .unwrap();

    db.set_time_for_testing(Some(5000));
    db.empty_trash(alice, 2000).unwrap();

    assert!(db.file_updates(alice, Set::Trash, 0).unwrap().is_empty());

    // A device that has caught up past the floor sees the trash
    // tombstone.
    let (deletes, out_of_sync) = db.delete_updates(alice, 2500).unwrap();
    assert!(!out_of_sync);
    assert_eq!(deletes.len(), 1);
    assert_eq!(deletes[0].kind, delete_type::TRASH);

    // A device behind the floor is told to resync.
    let (_, out_of_sync) = db.delete_updates(alice, 0).unwrap();
    assert!(out_of_sync);
}

// Replaying the deletion log from zero reconstructs the mutations.
#[test]
fn tombstones_reconstruct_history() {
    let (_dir, db) = test_db();
    let auth = auth_service(db.clone());
    let alice = new_account(&auth, "alice@example.com", "pw-a").user_id;
    let bob = new_account(&auth, "bob@example.com", "pw-b").user_id;

    db.set_time_for_testing(Some(1000));
    add_album(&db, alice, "a1");
    share(&db, alice, "a1", "1111", &[bob]);
    add_gallery_file(&db, alice, "f1", 1);
    db.move_file(
        alice,
        &mv(
            (Set::Gallery, None),
            (Set::Album, Some("a1")),
            true,
            &["f1"],
            &["h1"],
        ),
    )
    .unwrap();

    db.set_time_for_testing(Some(2000));
    db.move_file(
        alice,
        &mv(
            (Set::Album, Some("a1")),
            (Set::Trash, None),
            true,
            &["f1"],
            &["h2"],
        ),
    )
    .unwrap();

    db.set_time_for_testing(Some(3000));
    db.delete_album(alice, "a1").unwrap();

    let (deletes, _) = db.delete_updates(alice, 0).unwrap();
    // t=1000: f1 left the gallery; t=2000: f1 left the album (both
    // members logged); t=3000: the album itself.
    let kinds: Vec<(u8, i64)> = deletes.iter().map(|d| (d.kind, d.date)).collect();
    assert_eq!(
        kinds,
        vec![
            (delete_type::FILE, 1000),
            (delete_type::FILE, 2000),
            (delete_type::ALBUM, 3000),
        ]
    );

    // Bob saw the album-file removal and the album deletion.
    let (bob_deletes, _) = db.delete_updates(bob, 0).unwrap();
    let kinds: Vec<u8> = bob_deletes.iter().map(|d| d.kind).collect();
    assert_eq!(kinds, vec![delete_type::FILE, delete_type::ALBUM]);

    // Nothing is live.
    assert!(db.file_updates(alice, Set::Gallery, 0).unwrap().is_empty());
    assert!(db.file_updates(alice, Set::Album, 0).unwrap().is_empty());
    assert_eq!(db.file_updates(alice, Set::Trash, 0).unwrap().len(), 1);
    assert!(db.album_updates(bob, 0).unwrap().is_empty());
}

#[test]
fn add_contact_resolves_by_email() {
    let (_dir, db) = test_db();
    let auth = auth_service(db.clone());
    let alice = new_account(&auth, "alice@example.com", "pw-a").user_id;
    let bob = new_account(&auth, "bob@example.com", "pw-b");

    db.set_time_for_testing(Some(1000));
    let contact = db.add_contact(alice, "bob@example.com").unwrap();
    assert_eq!(contact.user_id, bob.user_id.to_string());
    assert_eq!(contact.email, "bob@example.com");

    let listed = db.contact_updates(alice, 0).unwrap();
    assert_eq!(listed.len(), 1);
    assert!(db.contact_updates(alice, 1000).unwrap().is_empty());

    assert!(db.add_contact(alice, "ghost@example.com").is_err());
    assert!(db.add_contact(alice, "alice@example.com").is_err());
}

#[test]
fn get_updates_assembles_every_collection() {
    let (_dir, db) = test_db();
    let auth = auth_service(db.clone());
    let alice = new_account(&auth, "alice@example.com", "pw-a").user_id;
    let bob = new_account(&auth, "bob@example.com", "pw-b").user_id;

    db.set_time_for_testing(Some(1000));
    add_album(&db, alice, "album");
    share(&db, alice, "album", "1111", &[bob]);
    add_gallery_file(&db, alice, "g", 7);

    let updates = db
        .get_updates(
            alice,
            &wire::GetUpdatesParams {
                files_st: 0,
                trash_st: 0,
                albums_st: 0,
                album_files_st: 0,
                cnt_st: 0,
                del_st: 0,
            },
        )
        .unwrap();
    assert_eq!(updates.files.len(), 1);
    assert_eq!(updates.albums.len(), 1);
    assert_eq!(updates.contacts.len(), 1);
    assert_eq!(updates.contacts[0].user_id, bob.to_string());
    assert_eq!(updates.space_used, 7);
    assert_eq!(updates.space_quota, -1);
    assert!(!updates.out_of_sync);
}

// Deleting a user cascades: albums vanish for members, contacts get
// tombstones, and the account is gone.
#[test]
fn delete_user_cascades() {
    let (_dir, db) = test_db();
    let auth = auth_service(db.clone());
    let alice = new_account(&auth, "alice@example.com", "pw-a").user_id;
    let bob = new_account(&auth, "bob@example.com", "pw-b").user_id;

    db.set_time_for_testing(Some(1000));
    add_album(&db, alice, "album");
    share(&db, alice, "album", "1111", &[bob]);

    db.set_time_for_testing(Some(2000));
    db.delete_user(alice).unwrap();

    assert!(db.user_by_id(alice).unwrap().is_none());
    assert!(db.user_by_email("alice@example.com").unwrap().is_none());
    assert!(db.album_updates(bob, 0).unwrap().is_empty());

    let (deletes, _) = db.delete_updates(bob, 0).unwrap();
    let kinds: Vec<u8> = deletes.iter().map(|d| d.kind).collect();
    assert!(kinds.contains(&delete_type::ALBUM));
    assert!(kinds.contains(&delete_type::CONTACT));
}
