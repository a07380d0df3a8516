//! Property tests for store idempotence, schema versioning and
//! monotonicity of union and exclusion.

use proptest::prelude::*;
use rebac_engine::*;
use std::collections::BTreeSet;

const GROUPS: &str = "
    entity user {}
    entity group {
        relation member @user @group#member
    }
    entity document {
        relation owner @user
        relation viewer @user @group#member
        relation banned @user
        permission view = owner or viewer
        permission edit = owner not banned
    }
";

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn user() -> impl Strategy<Value = String> {
    prop::sample::select(vec!["alice", "bob", "carol"]).prop_map(|u| format!("user:{u}"))
}

fn group() -> impl Strategy<Value = String> {
    prop::sample::select(vec!["a", "b", "c"]).prop_map(|g| format!("group:{g}"))
}

/// Tuples over a small universe so that groups nest and cycle often
fn grant() -> impl Strategy<Value = Tuple> {
    prop_oneof![
        user().prop_map(|u| format!("document:1#owner@{u}")),
        user().prop_map(|u| format!("document:1#viewer@{u}")),
        group().prop_map(|g| format!("document:1#viewer@{g}#member")),
        (group(), user()).prop_map(|(g, u)| format!("{g}#member@{u}")),
        (group(), group()).prop_map(|(g, h)| format!("{g}#member@{h}#member")),
    ]
    .prop_map(|t| t.parse::<Tuple>().unwrap())
}

fn ban() -> impl Strategy<Value = Tuple> {
    user().prop_map(|u| format!("document:1#banned@{u}").parse::<Tuple>().unwrap())
}

async fn engine_with(tuples: &[Tuple]) -> AuthorizationEngine {
    let engine = AuthorizationEngine::in_memory();
    let version = engine.write_schema(GROUPS).unwrap();
    for tuple in tuples {
        engine.write_tuple(tuple.clone(), &version).await.unwrap();
    }
    engine
}

async fn decide(engine: &AuthorizationEngine, user: &str, action: &str) -> Result<Decision> {
    let request = CheckRequest::new(Subject::user(user), action, Entity::new("document", "1"));
    engine.check(&request).await.map(|response| response.decision)
}

#[derive(Debug, Clone)]
enum Op {
    Write(Tuple),
    Delete(Tuple),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![grant().prop_map(Op::Write), grant().prop_map(Op::Delete)]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_store_matches_set_model(ops in prop::collection::vec(op(), 0..24)) {
        let rt = runtime();
        let stored = rt.block_on(async {
            let repository = InMemoryTupleRepository::new();
            for op in &ops {
                // Every operation is applied twice; the result must match applying it once.
                for _ in 0..2 {
                    match op {
                        Op::Write(t) => repository.write_tuple(t.clone()).await.unwrap(),
                        Op::Delete(t) => repository.delete_tuple(t.clone()).await.unwrap(),
                    }
                }
            }
            repository.read_tuples(&TupleFilter::default()).await.unwrap()
        });

        let mut model = BTreeSet::new();
        for op in &ops {
            match op {
                Op::Write(t) => { model.insert(t.clone()); }
                Op::Delete(t) => { model.remove(t); }
            }
        }

        let stored: BTreeSet<Tuple> = stored.into_iter().collect();
        prop_assert_eq!(stored, model);
    }

    #[test]
    fn prop_version_depends_only_on_text(names in prop::collection::btree_set("[a-z]{1,8}", 1..6)) {
        let text: String = names.iter().map(|n| format!("entity e_{n} {{}}\n")).collect();
        let limits = SchemaLimits::default();

        let first = Schema::compile(&text, &limits).unwrap();
        let second = Schema::compile(&text, &limits).unwrap();
        prop_assert_eq!(&first.version, &second.version);
        prop_assert_eq!(first.version.len(), 32);

        let padded = Schema::compile(&format!("{text} "), &limits).unwrap();
        prop_assert_ne!(&first.version, &padded.version);
    }

    #[test]
    fn prop_union_is_monotonic(
        base in prop::collection::vec(grant(), 0..10),
        extra in prop::collection::vec(grant(), 0..10),
        who in prop::sample::select(vec!["alice", "bob", "carol"]),
    ) {
        let rt = runtime();
        let (before, after) = rt.block_on(async {
            let before = decide(&engine_with(&base).await, who, "view").await;
            let all: Vec<Tuple> = base.iter().chain(extra.iter()).cloned().collect();
            let after = decide(&engine_with(&all).await, who, "view").await;
            (before, after)
        });

        if matches!(before, Ok(Decision::Allow)) {
            prop_assert!(matches!(after, Ok(Decision::Allow)), "lost access: {:?}", after);
        }
    }

    #[test]
    fn prop_exclusion_is_anti_monotonic(
        base in prop::collection::vec(prop_oneof![grant(), ban()], 0..10),
        bans in prop::collection::vec(ban(), 1..4),
        who in prop::sample::select(vec!["alice", "bob", "carol"]),
    ) {
        let rt = runtime();
        let (before, after) = rt.block_on(async {
            let before = decide(&engine_with(&base).await, who, "edit").await;
            let all: Vec<Tuple> = base.iter().chain(bans.iter()).cloned().collect();
            let after = decide(&engine_with(&all).await, who, "edit").await;
            (before, after)
        });

        prop_assert!(before.is_ok() && after.is_ok());
        if matches!(before, Ok(Decision::Deny)) {
            prop_assert!(matches!(after, Ok(Decision::Deny)), "banning granted access: {:?}", after);
        }
    }
}
