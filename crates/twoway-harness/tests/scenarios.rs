//! Multi-sync, same-name and symlink scenarios across cooperating agents.

mod common;

use std::fs;
use std::thread;

use common::{agent, login, settle, setup};
use twoway_harness::{fixtures, Confirm, Model, ModelNode, TestAgent};

/// How many nodes called `name` sit directly in the remote base folder.
fn remote_count(agent: &TestAgent, name: &str) -> usize {
    let name = name.to_string();
    agent
        .thread_do("count remote", move |core, promise| {
            let count = core
                .resolve("")
                .map(|base| core.engine.children_named(base, &name).len())
                .unwrap_or(0);
            promise.set(count)
        })
        .wait()
        .unwrap()
}

fn login_reset(agent: &TestAgent) {
    let context = agent.context();
    agent.login_reset(context.user(), context.password()).unwrap();
}

#[test]
fn move_local_folder_between_syncs() {
    let (_root, context) = setup();
    let a1 = agent(&context, "clientA1");
    let a2 = agent(&context, "clientA2");
    let a3 = agent(&context, "clientA3");
    a1.login_reset_make_remote_nodes("f", 3, 3).unwrap();
    login(&a2);
    login(&a3);

    let a1_s1 = a1.setup_sync("sync1", "f/f_0").unwrap();
    let a1_s2 = a1.setup_sync("sync2", "f/f_2").unwrap();
    let a2_s1 = a2.setup_sync("sync1", "f/f_0").unwrap();
    let a2_s2 = a2.setup_sync("sync2", "f/f_2").unwrap();
    let a3_s = a3.setup_sync("sync3", "f").unwrap();
    settle(&[&a1, &a2, &a3]);

    let mut model = Model::new();
    model.add_subtree("", ModelNode::subdir_tree("f", 3, 3, 0));
    let f_0 = model.find("f/f_0").unwrap();
    let f_2 = model.find("f/f_2").unwrap();
    assert!(a1.confirm_model(a1_s1, f_0, Confirm::ALL, false));
    assert!(a1.confirm_model(a1_s2, f_2, Confirm::ALL, false));
    assert!(a2.confirm_model(a2_s1, f_0, Confirm::ALL, false));
    assert!(a2.confirm_model(a2_s2, f_2, Confirm::ALL, false));
    assert!(a3.confirm_model(a3_s, model.find("f").unwrap(), Confirm::ALL, false));

    let from = a1.sync_root(a1_s1).unwrap().unwrap().join("f_0_1");
    let to = a1
        .sync_root(a1_s2)
        .unwrap()
        .unwrap()
        .join("f_2_1")
        .join("f_2_1_0")
        .join("f_0_1");
    fs::rename(from, to).unwrap();
    settle(&[&a1, &a2, &a3]);

    // Leaving one sync for another is a delete plus an add; observers keep
    // the old copy in their debris
    assert!(model.move_node("f/f_0/f_0_1", "f/f_2/f_2_1/f_2_1_0"));
    let f_0 = model.find("f/f_0").unwrap();
    let f_2 = model.find("f/f_2").unwrap();
    assert!(a1.confirm_model(a1_s1, f_0, Confirm::ALL, false));
    assert!(a1.confirm_model(a1_s2, f_2, Confirm::ALL, false));
    assert!(a2.confirm_model(a2_s1, f_0, Confirm::ALL, true));
    assert!(a2.confirm_model(a2_s2, f_2, Confirm::ALL, false));
    assert!(a3.confirm_model(a3_s, model.find("f").unwrap(), Confirm::ALL, true));
}

#[test]
fn move_existing_into_new_local_folder() {
    let (_root, context) = setup();
    let a1 = agent(&context, "clientA1");
    let a2 = agent(&context, "clientA2");
    a1.login_reset_make_remote_nodes("f", 3, 3).unwrap();
    login(&a2);

    let s1 = a1.setup_sync("sync1", "f").unwrap();
    let s2 = a2.setup_sync("sync2", "f").unwrap();
    settle(&[&a1, &a2]);

    let mut model = Model::new();
    model.add_subtree("", ModelNode::subdir_tree("f", 3, 3, 0));
    assert!(a1.confirm_model(s1, model.find("f").unwrap(), Confirm::ALL, false));
    assert!(a2.confirm_model(s2, model.find("f").unwrap(), Confirm::ALL, false));

    let root1 = a1.sync_root(s1).unwrap().unwrap();
    fixtures::build_local_folders(&root1, "new", 1, 0, 0).unwrap();
    fs::rename(root1.join("f_2"), root1.join("new").join("f_2")).unwrap();
    settle(&[&a1, &a2]);

    assert!(model.add_folder("f/new").is_some());
    assert!(model.move_node("f/f_2", "f/new"));
    assert!(a1.confirm_model(s1, model.find("f").unwrap(), Confirm::ALL, false));
    assert!(a2.confirm_model(s2, model.find("f").unwrap(), Confirm::ALL, false));
    // Moved by handle, nothing was fetched again
    assert_eq!(a2.transfer_counts().added, 0);
}

#[cfg(target_os = "linux")]
#[test]
fn sync_duplicate_names() {
    let (_root, context) = setup();
    let a1 = agent(&context, "clientA1");
    let a2 = agent(&context, "clientA2");
    login_reset(&a1);
    login(&a2);
    assert_eq!(
        a1.base_folder_handle().unwrap(),
        a2.base_folder_handle().unwrap()
    );

    for name in ["samename", "samename", "Samename"] {
        a1.upload_model_tree(&ModelNode::folder(name), "").unwrap();
    }
    assert_eq!(remote_count(&a1, "samename"), 2);

    let s1 = a1.setup_sync("sync1", "").unwrap();
    let s2 = a2.setup_sync("sync2", "").unwrap();
    settle(&[&a1, &a2]);

    // Locally one folder stands for both same-named siblings
    let mut local = ModelNode::folder("base");
    local.add_kid(ModelNode::folder("samename"));
    local.add_kid(ModelNode::folder("Samename"));
    let mut remote = local.clone();
    remote.kids.push(ModelNode::folder("samename"));

    for (agent, sync) in [(&a1, s1), (&a2, s2)] {
        assert!(agent.confirm_model(sync, &local, Confirm::LOCAL, false));
        assert!(agent.confirm_model(sync, &remote, Confirm::REMOTE, false));
    }
}

#[test]
fn remote_folder_creation_race_samename() {
    let (_root, context) = setup();
    let a1 = agent(&context, "clientA1");
    let a2 = agent(&context, "clientA2");
    login_reset(&a1);
    login(&a2);

    let s1 = a1.setup_sync("sync1", "").unwrap();
    let s2 = a2.setup_sync("sync2", "").unwrap();
    settle(&[&a1, &a2]);

    thread::scope(|s| {
        let first = s.spawn(|| a1.make_cloud_subdirs("f", 3, 3, "").unwrap());
        let second = s.spawn(|| a2.make_cloud_subdirs("f", 3, 3, "").unwrap());
        assert_eq!(first.join().unwrap().len(), 40);
        assert_eq!(second.join().unwrap().len(), 40);
    });
    settle(&[&a1, &a2]);

    // Both trees stay in the cloud; each sync follows just one of them
    assert_eq!(remote_count(&a1, "f"), 2);
    let mut local = ModelNode::folder("base");
    local.add_kid(ModelNode::subdir_tree("f", 3, 3, 0));
    let mut remote = local.clone();
    remote.kids.push(ModelNode::subdir_tree("f", 3, 3, 0));

    for (agent, sync) in [(&a1, s1), (&a2, s2)] {
        assert!(agent.confirm_model(sync, &local, Confirm::LOCAL, false));
        assert!(agent.confirm_model(sync, &remote, Confirm::REMOTE, false));
    }
}

#[test]
fn local_folder_creation_race_samename() {
    let (_root, context) = setup();
    let a1 = agent(&context, "clientA1");
    let a2 = agent(&context, "clientA2");
    login_reset(&a1);
    login(&a2);

    let s1 = a1.setup_sync("sync1", "").unwrap();
    let s2 = a2.setup_sync("sync2", "").unwrap();
    settle(&[&a1, &a2]);

    let build = |agent: &TestAgent, sync| {
        let root = agent.sync_root(sync).unwrap().unwrap();
        agent.thread_do("build local f", move |_, promise| {
            promise.set(fixtures::build_local_folders(&root, "f", 3, 3, 0).is_ok())
        })
    };
    let first = build(&a1, s1);
    let second = build(&a2, s2);
    assert!(first.wait().unwrap());
    assert!(second.wait().unwrap());
    settle(&[&a1, &a2]);

    let mut local = ModelNode::folder("base");
    local.add_kid(ModelNode::subdir_tree("f", 3, 3, 0));
    assert!(a1.confirm_model(s1, &local, Confirm::LOCAL, false));
    assert!(a2.confirm_model(s2, &local, Confirm::LOCAL, false));
    // Whether the second upload found the first in time decides the copies
    let copies = remote_count(&a1, "f");
    assert!((1..=2).contains(&copies), "{} remote copies of f", copies);
}

#[test]
fn resume_after_nonclashing_local_and_remote_changes() {
    let (_root, context) = setup();
    let a1 = agent(&context, "clientA1");
    let a2 = agent(&context, "clientA2");
    a1.login_reset_make_remote_nodes("f", 3, 3).unwrap();
    login(&a2);

    let s1 = a1.setup_sync("sync1", "f").unwrap();
    let s2 = a2.setup_sync("sync2", "f").unwrap();
    settle(&[&a1, &a2]);

    let mut model1 = Model::new();
    model1.add_subtree("", ModelNode::subdir_tree("f", 3, 3, 0));
    let mut model2 = model1.clone();
    assert!(a1.confirm_model(s1, model1.find("f").unwrap(), Confirm::ALL, false));
    assert!(a2.confirm_model(s2, model2.find("f").unwrap(), Confirm::ALL, false));

    let session = a1.dump_session().unwrap().unwrap();
    let root1 = a1.sync_root(s1).unwrap().unwrap();
    a1.local_logout().unwrap();
    drop(a1);

    a2.make_cloud_subdirs("newremote", 2, 2, "f/f_1/f_1_0").unwrap();
    for model in [&mut model1, &mut model2] {
        assert!(model.add_subtree("f/f_1/f_1_0", ModelNode::subdir_tree("newremote", 2, 2, 0)));
    }

    a2.delete_remote("f/f_0").unwrap();
    assert!(model1.move_to_trash("f/f_0", "f"));
    assert!(model2.move_to_trash("f/f_0", "f"));

    fixtures::build_local_folders(&root1.join("f_1").join("f_1_2"), "newlocal", 2, 2, 2).unwrap();
    for model in [&mut model1, &mut model2] {
        assert!(model.add_subtree("f/f_1/f_1_2", ModelNode::subdir_tree("newlocal", 2, 2, 2)));
    }

    fs::remove_dir_all(root1.join("f_2")).unwrap();
    assert!(model1.remove("f/f_2").is_some());
    assert!(model2.move_to_trash("f/f_2", "f"));

    settle(&[&a2]);

    let a1 = agent(&context, "clientA1");
    a1.login_fetch_nodes_session(&session).unwrap();
    assert_eq!(
        a1.base_folder_handle().unwrap(),
        a2.base_folder_handle().unwrap()
    );
    settle(&[&a1, &a2]);

    assert!(a1.confirm_model(s1, model1.find("f").unwrap(), Confirm::ALL, false));
    // a2 fetched the new local files
    assert!(model2.ensure_local_debris_tmp_lock("f"));
    assert!(a2.confirm_model(s2, model2.find("f").unwrap(), Confirm::ALL, false));
}

#[cfg(unix)]
mod links {
    use super::*;
    use std::sync::Arc;
    use twoway_core::SyncId;
    use twoway_harness::HarnessContext;

    struct Linked {
        a1: TestAgent,
        a2: TestAgent,
        s1: SyncId,
        s2: SyncId,
        model: Model,
    }

    impl Linked {
        /// `f` holding one folder `f_0`, synced by both agents, with a
        /// symlink `linked -> f_0` added in the first agent's sync.
        fn start(context: &Arc<HarnessContext>) -> Linked {
            let a1 = agent(context, "clientA1");
            let a2 = agent(context, "clientA2");
            a1.login_reset_make_remote_nodes("f", 1, 1).unwrap();
            login(&a2);

            let s1 = a1.setup_sync("sync1", "f").unwrap();
            let s2 = a2.setup_sync("sync2", "f").unwrap();
            settle(&[&a1, &a2]);

            let mut model = Model::new();
            model.add_subtree("", ModelNode::subdir_tree("f", 1, 1, 0));
            let linked = Linked {
                a1,
                a2,
                s1,
                s2,
                model,
            };
            assert!(linked.confirm_a1());
            assert!(linked.confirm_a2());

            let root = linked.root1();
            fixtures::create_symlink(&root.join("f_0"), &root.join("linked")).unwrap();
            linked.settle();
            // Links are not synced
            assert!(linked.confirm_a1());
            assert!(linked.confirm_a2());
            linked
        }

        fn root1(&self) -> std::path::PathBuf {
            self.a1.sync_root(self.s1).unwrap().unwrap()
        }

        fn settle(&self) {
            settle(&[&self.a1, &self.a2]);
        }

        fn confirm_a1(&self) -> bool {
            let f = self.model.find("f").unwrap();
            self.a1.confirm_model(self.s1, f, Confirm::ALL, false)
        }

        fn confirm_a2(&self) -> bool {
            let f = self.model.find("f").unwrap();
            self.a2.confirm_model(self.s2, f, Confirm::ALL, false)
        }
    }

    #[test]
    fn create_and_delete_link() {
        let (_root, context) = setup();
        let linked = Linked::start(&context);

        fixtures::remove_symlink(&linked.root1().join("linked")).unwrap();
        linked.settle();

        assert!(linked.confirm_a2());
        assert!(linked.confirm_a1());
    }

    #[test]
    fn create_rename_and_delete_link() {
        let (_root, context) = setup();
        let linked = Linked::start(&context);
        let root = linked.root1();

        fs::rename(root.join("linked"), root.join("linkrenamed")).unwrap();
        linked.settle();
        assert!(linked.confirm_a2());

        fixtures::remove_symlink(&root.join("linkrenamed")).unwrap();
        linked.settle();
        assert!(linked.confirm_a2());
        assert!(linked.confirm_a1());
    }

    #[test]
    fn replace_link_locally() {
        let (_root, context) = setup();
        let mut linked = Linked::start(&context);
        let root = linked.root1();

        // A folder cannot be renamed over a non-folder
        assert!(fs::rename(root.join("f_0"), root.join("linked")).is_err());
        linked.settle();
        assert!(linked.confirm_a2());

        fixtures::remove_symlink(&root.join("linked")).unwrap();
        fixtures::create_name_file(&root, "linked").unwrap();
        linked.settle();

        linked.model.add_file("f/linked", b"linked".to_vec());
        assert!(linked.confirm_a1());
        linked.model.ensure_local_debris_tmp_lock("f");
        assert!(linked.confirm_a2());
    }

    #[test]
    fn replace_link_upon_sync_down() {
        let (_root, context) = setup();
        let mut linked = Linked::start(&context);

        let root2 = linked.a2.sync_root(linked.s2).unwrap().unwrap();
        fixtures::create_name_file(&root2, "linked").unwrap();
        linked.settle();

        // The download lands on top of the link itself
        linked.model.add_file("f/linked", b"linked".to_vec());
        assert!(linked.confirm_a2());
        linked.model.ensure_local_debris_tmp_lock("f");
        assert!(linked.confirm_a1());
        assert!(fs::symlink_metadata(linked.root1().join("linked"))
            .unwrap()
            .is_file());
    }
}
