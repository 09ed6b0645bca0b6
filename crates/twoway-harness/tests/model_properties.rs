use proptest::prelude::*;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use twoway_core::NodeKind;
use twoway_harness::reconcile::FsNode;
use twoway_harness::{match_tree, MatchPolicy, Model, ModelNode};

const NAMES: [&str; 6] = ["a", "b", "c", "d", "e", "f"];

fn random_folder(rng: &mut ChaCha8Rng, name: &str, depth: usize) -> ModelNode {
    let mut folder = ModelNode::folder(name);
    for _ in 0..rng.gen_range(0..5) {
        let name = NAMES[rng.gen_range(0..NAMES.len())];
        if depth > 0 && rng.gen_bool(0.4) {
            folder.add_kid(random_folder(rng, name, depth - 1));
        } else {
            let len = rng.gen_range(0..48);
            let content: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
            folder.add_kid(ModelNode::file(name, content));
        }
    }
    folder
}

fn random_model(seed: u64) -> Model {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut model = Model::new();
    model.root = random_folder(&mut rng, "", 3);
    model
}

fn paths(node: &ModelNode, prefix: &str, out: &mut Vec<(String, NodeKind)>) {
    for kid in &node.kids {
        let path = if prefix.is_empty() {
            kid.name.clone()
        } else {
            format!("{}/{}", prefix, kid.name)
        };
        out.push((path.clone(), kid.kind));
        paths(kid, &path, out);
    }
}

/// Apply one random edit, or none.
fn mutate(model: &mut Model, seed: u64) {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut all = Vec::new();
    paths(&model.root, "", &mut all);
    if all.is_empty() {
        return;
    }
    let (path, kind) = all[rng.gen_range(0..all.len())].clone();
    match rng.gen_range(0..4) {
        0 => {
            model.remove(&path);
        }
        1 if kind == NodeKind::File => {
            if let Some(node) = model.find_mut(&path) {
                node.set_content(b"edited".to_vec());
            }
        }
        2 => {
            model.emulate_rename(&path, NAMES[rng.gen_range(0..NAMES.len())]);
        }
        _ => {}
    }
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 48,
        .. ProptestConfig::default()
    })]

    #[test]
    fn prop_generated_tree_matches_its_model(seed in any::<u64>()) {
        let dir = tempfile::tempdir().unwrap();
        let mut model = random_model(seed);
        model.generate(dir.path()).unwrap();

        let observed = FsNode::at(dir.path()).unwrap();
        let result = match_tree(&model.root, observed, &MatchPolicy::default());
        prop_assert!(result.is_ok(), "seed {}: {:?}\n{}", seed, result, model);
    }

    #[test]
    fn prop_matching_is_symmetric(seed in any::<u64>(), edit in any::<u64>()) {
        let a = random_model(seed);
        let mut b = a.clone();
        mutate(&mut b, edit);

        let policy = MatchPolicy::default();
        let forward = match_tree(&a.root, &b.root, &policy).is_ok();
        let backward = match_tree(&b.root, &a.root, &policy).is_ok();
        prop_assert_eq!(forward, backward, "seed {} edit {}", seed, edit);
    }

    #[test]
    fn prop_model_matches_itself(seed in any::<u64>()) {
        let model = random_model(seed);
        prop_assert!(match_tree(&model.root, &model.root, &MatchPolicy::default()).is_ok());
    }
}
