//! Two agents syncing the same remote folder, one of them making a change.

mod common;

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use common::{agent, login, settle, setup};
use twoway_core::SyncId;
use twoway_harness::{fixtures, Confirm, HarnessContext, Model, ModelNode, TestAgent};

struct Pair {
    a1: TestAgent,
    a2: TestAgent,
    s1: SyncId,
    s2: SyncId,
    model: Model,
}

impl Pair {
    /// `f` built as `subdir_tree("f", 3, 3, 0)` on the remote side, synced by
    /// both agents and confirmed.
    fn start(context: &Arc<HarnessContext>) -> Pair {
        let a1 = agent(context, "clientA1");
        let a2 = agent(context, "clientA2");
        a1.login_reset_make_remote_nodes("f", 3, 3).unwrap();
        login(&a2);
        assert_eq!(
            a1.base_folder_handle().unwrap(),
            a2.base_folder_handle().unwrap()
        );

        let s1 = a1.setup_sync("sync1", "f").unwrap();
        let s2 = a2.setup_sync("sync2", "f").unwrap();
        settle(&[&a1, &a2]);

        let mut model = Model::new();
        model.add_subtree("", ModelNode::subdir_tree("f", 3, 3, 0));
        let pair = Pair {
            a1,
            a2,
            s1,
            s2,
            model,
        };
        pair.confirm_both();
        pair
    }

    fn f(&self) -> &ModelNode {
        self.model.find("f").unwrap()
    }

    fn confirm_a1(&self) -> bool {
        self.a1.confirm_model(self.s1, self.f(), Confirm::ALL, false)
    }

    fn confirm_a2(&self) -> bool {
        self.a2.confirm_model(self.s2, self.f(), Confirm::ALL, false)
    }

    fn confirm_both(&self) {
        assert!(self.confirm_a1());
        assert!(self.confirm_a2());
    }

    fn root1(&self) -> PathBuf {
        self.a1.sync_root(self.s1).unwrap().unwrap()
    }
}

#[test]
fn delete_remote_folder_reaches_both_agents() {
    let (_root, context) = setup();
    let mut pair = Pair::start(&context);

    pair.a1.delete_remote("f/f_2/f_2_1").unwrap();
    settle(&[&pair.a1, &pair.a2]);

    assert!(pair.model.move_to_trash("f/f_2/f_2_1", "f"));
    pair.confirm_both();
}

#[test]
fn delete_local_folder_is_unlinked_remotely() {
    let (_root, context) = setup();
    let mut pair = Pair::start(&context);

    fs::remove_dir_all(pair.root1().join("f_2").join("f_2_1")).unwrap();
    settle(&[&pair.a1, &pair.a2]);

    // Only the observer keeps a copy in its debris
    assert!(pair.model.move_to_trash("f/f_2/f_2_1", "f"));
    assert!(pair.confirm_a2());
    assert!(pair.model.remove_sync_trash("f", ""));
    assert!(pair.confirm_a1());
}

#[test]
fn move_local_folder_moves_remote_node() {
    let (_root, context) = setup();
    let mut pair = Pair::start(&context);
    let root = pair.root1();

    fs::rename(root.join("f_2").join("f_2_1"), root.join("f_2_1")).unwrap();
    settle(&[&pair.a1, &pair.a2]);

    assert!(pair.model.move_node("f/f_2/f_2_1", "f"));
    pair.confirm_both();
    assert_eq!(pair.a1.transfer_counts().added, 0);
}

#[test]
fn rename_local_file() {
    let (_root, context) = setup();
    let c0 = agent(&context, "c0");
    let c1 = agent(&context, "c1");
    c0.login_reset_make_remote_nodes("x", 0, 0).unwrap();
    login(&c1);

    let s0 = c0.setup_sync("s0", "x").unwrap();
    let s1 = c1.setup_sync("s1", "x").unwrap();
    settle(&[&c0, &c1]);

    let root0 = c0.sync_root(s0).unwrap().unwrap();
    fixtures::create_name_file(&root0, "f").unwrap();
    settle(&[&c0, &c1]);

    let mut model = Model::new();
    model.add_folder("x");
    model.add_file("x/f", b"f".to_vec());
    let x = model.find("x").unwrap();
    assert!(c0.confirm_model(s0, x, Confirm::ALL, false));
    // c1 downloaded, so its debris holds the tmp lock
    assert!(c1.confirm_model(s1, x, Confirm::ALL, true));

    fs::rename(root0.join("f"), root0.join("g")).unwrap();
    settle(&[&c0, &c1]);

    assert!(model.emulate_rename("x/f", "g"));
    let x = model.find("x").unwrap();
    assert!(c0.confirm_model(s0, x, Confirm::ALL, false));
    assert!(c1.confirm_model(s1, x, Confirm::ALL, true));
    assert!(c1.transfer_counts().completed >= 1);
}

#[test]
fn add_local_folder_tree() {
    let (_root, context) = setup();
    let mut pair = Pair::start(&context);

    fixtures::build_local_folders(&pair.root1().join("f_2"), "newkid", 2, 2, 2).unwrap();
    settle(&[&pair.a1, &pair.a2]);

    pair.model
        .find_mut("f/f_2")
        .unwrap()
        .add_kid(ModelNode::subdir_tree("newkid", 2, 2, 2));
    assert!(pair.confirm_a1());
    pair.model.ensure_local_debris_tmp_lock("f");
    assert!(pair.confirm_a2());
}

#[test]
fn remove_local_node_before_session_resume() {
    let (_root, context) = setup();
    let Pair {
        a1,
        a2,
        s1,
        s2,
        mut model,
    } = Pair::start(&context);

    let session = a1.dump_session().unwrap().unwrap();
    let root1 = a1.sync_root(s1).unwrap().unwrap();
    a1.local_logout().unwrap();
    drop(a1);

    fs::remove_dir_all(root1.join("f_2")).unwrap();

    let a1 = agent(&context, "clientA1");
    a1.login_fetch_nodes_session(&session).unwrap();
    settle(&[&a1, &a2]);

    assert!(model.move_to_trash("f/f_2", "f"));
    assert!(a2.confirm_model(s2, model.find("f").unwrap(), Confirm::ALL, false));
    assert!(model.remove_sync_trash("f", ""));
    assert!(a1.confirm_model(s1, model.find("f").unwrap(), Confirm::ALL, false));
}

#[test]
fn clashing_local_add_and_remote_delete_during_pause() {
    let (_root, context) = setup();
    let Pair {
        a1,
        a2,
        s1,
        s2,
        mut model,
    } = Pair::start(&context);

    let session = a1.dump_session().unwrap().unwrap();
    let root1 = a1.sync_root(s1).unwrap().unwrap();
    a1.local_logout().unwrap();
    drop(a1);

    a2.delete_remote("f/f_1").unwrap();
    fixtures::build_local_folders(&root1.join("f_1").join("f_1_2"), "newlocal", 2, 2, 2).unwrap();
    settle(&[&a2]);

    let a1 = agent(&context, "clientA1");
    a1.login_fetch_nodes_session(&session).unwrap();
    assert_eq!(
        a1.base_folder_handle().unwrap(),
        a2.base_folder_handle().unwrap()
    );
    settle(&[&a1, &a2]);

    // The resumed agent moves the whole folder aside, new content included
    model
        .find_mut("f/f_1/f_1_2")
        .unwrap()
        .add_kid(ModelNode::subdir_tree("newlocal", 2, 2, 2));
    assert!(model.move_to_trash("f/f_1", "f"));
    assert!(a1.confirm_model(s1, model.find("f").unwrap(), Confirm::ALL, false));

    assert!(model.remove_sync_trash("f", "f_1/f_1_2/newlocal"));
    assert!(a2.confirm_model(s2, model.find("f").unwrap(), Confirm::ALL, false));
}
