//! Ledger invariants checked against a set model over random operation
//! sequences on a small domain.

use std::collections::BTreeSet;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use taskdriver::CreatedResources;

const KINDS: [&str; 3] = ["image", "device", "file"];
const IDS: [&str; 3] = ["a", "b", "c"];

type Model = BTreeSet<(String, String)>;

fn model_of(ledger: &CreatedResources) -> Model {
    ledger
        .iter()
        .flat_map(|(kind, ids)| ids.iter().map(move |id| (kind.to_string(), id.clone())))
        .collect()
}

fn assert_well_formed(ledger: &CreatedResources) {
    for (kind, ids) in ledger.iter() {
        assert!(!ids.is_empty(), "kind {kind} has no ids");
        let unique: BTreeSet<_> = ids.iter().collect();
        assert_eq!(unique.len(), ids.len(), "duplicate ids under {kind}");
    }
    assert_eq!(ledger.len(), model_of(ledger).len());
    assert_eq!(ledger.is_empty(), ledger.len() == 0);
}

fn random_ledger(rng: &mut StdRng) -> (CreatedResources, Model) {
    let mut ledger = CreatedResources::new();
    let mut model = Model::new();
    for _ in 0..rng.gen_range(0..8) {
        let kind = KINDS[rng.gen_range(0..KINDS.len())];
        let id = IDS[rng.gen_range(0..IDS.len())];
        if rng.gen_bool(0.7) {
            ledger.add(kind, id);
            model.insert((kind.to_string(), id.to_string()));
        } else {
            let removed = ledger.remove(kind, id);
            assert_eq!(removed, model.remove(&(kind.to_string(), id.to_string())));
        }
        assert_well_formed(&ledger);
        assert_eq!(model_of(&ledger), model);
    }
    (ledger, model)
}

#[test]
fn add_and_remove_track_set_semantics() {
    let mut rng = StdRng::seed_from_u64(7);
    for _ in 0..500 {
        let (ledger, model) = random_ledger(&mut rng);
        for kind in KINDS {
            for id in IDS {
                assert_eq!(
                    ledger.contains(kind, id),
                    model.contains(&(kind.to_string(), id.to_string()))
                );
            }
        }
    }
}

#[test]
fn merge_is_set_union_and_idempotent() {
    let mut rng = StdRng::seed_from_u64(11);
    for _ in 0..500 {
        let (left, left_model) = random_ledger(&mut rng);
        let (right, right_model) = random_ledger(&mut rng);

        let mut merged = left.clone();
        merged.merge(Some(&right));
        assert_well_formed(&merged);
        let union: Model = left_model.union(&right_model).cloned().collect();
        assert_eq!(model_of(&merged), union);

        let mut twice = merged.clone();
        twice.merge(Some(&right));
        assert_eq!(twice, merged);

        let mut reversed = right.clone();
        reversed.merge(Some(&left));
        assert_eq!(model_of(&reversed), union);

        let mut untouched = left.clone();
        untouched.merge(None);
        assert_eq!(untouched, left);
    }
}

#[test]
fn removing_everything_leaves_an_empty_ledger() {
    let mut rng = StdRng::seed_from_u64(13);
    for _ in 0..200 {
        let (mut ledger, model) = random_ledger(&mut rng);
        for (kind, id) in &model {
            assert!(ledger.remove(kind, id));
        }
        assert!(ledger.is_empty());
        assert_eq!(ledger.kinds().count(), 0);
        assert_eq!(ledger, CreatedResources::new());
    }
}

#[test]
fn persisted_form_round_trips_membership() {
    let mut rng = StdRng::seed_from_u64(17);
    for _ in 0..200 {
        let (ledger, model) = random_ledger(&mut rng);
        let json = serde_json::to_string(&ledger).unwrap();
        let loaded: CreatedResources = serde_json::from_str(&json).unwrap();
        assert_eq!(loaded, ledger);
        assert_eq!(model_of(&loaded), model);
    }
}
