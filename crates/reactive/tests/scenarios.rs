//! End-to-end live query scenarios.

use std::rc::Rc;

use hashbrown::HashMap;
use vela_core::{Key, NullsOrder, Record, SortSpec, Value};
use vela_incremental::{AggregateKind, JoinKind};
use vela_query::{
    AggregateExpr, CollectionRef, Expr, GroupBy, JoinClause, OrderByKey, QueryIr,
};
use vela_reactive::{
    LiveQuery, MemoryCollection, ResultCollection, SourceCollection,
};

fn emp(name: &str, salary: impl Into<Value>, dept: i64) -> Value {
    let mut r = Record::new();
    r.set("id", Value::from(name));
    r.set("name", Value::from(name));
    r.set("salary", salary.into());
    r.set("dept_id", Value::Int(dept));
    Value::Record(r)
}

fn employees() -> Rc<MemoryCollection> {
    let coll = MemoryCollection::new("employees").with_key_field("id");
    coll.insert(Key::Str("A".into()), emp("A", 50_000i64, 1));
    coll.insert(Key::Str("B".into()), emp("B", 60_000i64, 2));
    coll.insert(Key::Str("C".into()), emp("C", 55_000i64, 1));
    coll.insert(Key::Str("D".into()), emp("D", 65_000i64, 2));
    coll.insert(Key::Str("E".into()), emp("E", 52_000i64, 1));
    Rc::new(coll)
}

fn sources(pairs: &[(&str, Rc<MemoryCollection>)]) -> HashMap<String, Rc<dyn SourceCollection>> {
    let mut map: HashMap<String, Rc<dyn SourceCollection>> = HashMap::new();
    for (id, coll) in pairs {
        map.insert((*id).into(), coll.clone());
    }
    map
}

fn salary_desc_query(offset: usize, limit: usize) -> QueryIr {
    let mut ir = QueryIr::from_collection("employees", "emp");
    ir.order_by
        .push(OrderByKey::new(Expr::col("emp", "salary"), SortSpec::desc()));
    ir.offset = offset;
    ir.limit = Some(limit);
    ir
}

fn salaries(query: &LiveQuery) -> Vec<(String, i64)> {
    query
        .results()
        .into_iter()
        .map(|(key, value)| {
            let record = value.as_record().expect("row record");
            (
                key.as_str().unwrap().to_string(),
                record.get("salary").and_then(Value::as_int).unwrap_or(-1),
            )
        })
        .collect()
}

#[test]
fn top_k_with_offset() {
    let coll = employees();
    let sources = sources(&[("employees", coll.clone())]);
    let sink = ResultCollection::new();
    let query = LiveQuery::new(&salary_desc_query(1, 2), &sources, sink.clone()).unwrap();

    assert!(query.is_ready());
    assert_eq!(salaries(&query), [("B".to_string(), 60_000), ("C".to_string(), 55_000)]);

    // A new top earner shifts the window down.
    coll.insert(Key::Str("G".into()), emp("G", 70_000i64, 1));
    assert_eq!(salaries(&query), [("D".to_string(), 65_000), ("B".to_string(), 60_000)]);
    assert!(query.error().is_none());
}

#[test]
fn top_k_insert_into_window() {
    let coll = employees();
    let sources = sources(&[("employees", coll.clone())]);
    let query =
        LiveQuery::new(&salary_desc_query(1, 2), &sources, ResultCollection::new()).unwrap();

    coll.insert(Key::Str("G".into()), emp("G", 62_000i64, 1));
    assert_eq!(salaries(&query), [("G".to_string(), 62_000), ("B".to_string(), 60_000)]);
}

#[test]
fn top_k_insert_below_window() {
    let coll = employees();
    let sources = sources(&[("employees", coll.clone())]);
    let sink = ResultCollection::new();
    let query = LiveQuery::new(&salary_desc_query(1, 2), &sources, sink.clone()).unwrap();
    let writes_before = sink.change_log().len();

    coll.insert(Key::Str("G".into()), emp("G", 43_000i64, 1));
    assert_eq!(salaries(&query), [("B".to_string(), 60_000), ("C".to_string(), 55_000)]);
    // The change never reached the result collection.
    assert_eq!(sink.change_log().len(), writes_before);
}

#[test]
fn top_k_asc_underfilled_window() {
    let coll = employees();
    let sources = sources(&[("employees", coll.clone())]);
    let mut ir = QueryIr::from_collection("employees", "emp");
    ir.order_by
        .push(OrderByKey::new(Expr::col("emp", "salary"), SortSpec::asc()));
    ir.offset = 1;
    ir.limit = Some(10);
    let query = LiveQuery::new(&ir, &sources, ResultCollection::new()).unwrap();

    assert_eq!(
        salaries(&query).iter().map(|(_, s)| *s).collect::<Vec<_>>(),
        [52_000, 55_000, 60_000, 65_000]
    );

    // The window was not full, so a row past the old maximum still lands.
    coll.insert(Key::Str("G".into()), emp("G", 72_000i64, 1));
    assert_eq!(
        salaries(&query).iter().map(|(_, s)| *s).collect::<Vec<_>>(),
        [52_000, 55_000, 60_000, 65_000, 72_000]
    );
}

#[test]
fn top_k_update_inside_window() {
    let coll = employees();
    let sources = sources(&[("employees", coll.clone())]);
    let query =
        LiveQuery::new(&salary_desc_query(1, 2), &sources, ResultCollection::new()).unwrap();

    coll.update(Key::Str("B".into()), emp("B", 62_000i64, 2));
    assert_eq!(salaries(&query), [("B".to_string(), 62_000), ("C".to_string(), 55_000)]);
}

#[test]
fn top_k_delete_inside_window_refills() {
    let coll = employees();
    let sources = sources(&[("employees", coll.clone())]);
    let query =
        LiveQuery::new(&salary_desc_query(1, 2), &sources, ResultCollection::new()).unwrap();

    // Deleting B shrinks the window; the driver pulls E back from the
    // sorted index to refill it.
    coll.delete(&Key::Str("B".into()));
    assert_eq!(salaries(&query), [("C".to_string(), 55_000), ("E".to_string(), 52_000)]);
}

#[test]
fn top_k_without_sorted_index_degrades() {
    // Same query, but the source offers no sorted index: the all-changes
    // mode must produce identical results.
    let coll = MemoryCollection::new("employees")
        .with_key_field("id")
        .without_sorted_index();
    coll.insert(Key::Str("A".into()), emp("A", 50_000i64, 1));
    coll.insert(Key::Str("B".into()), emp("B", 60_000i64, 2));
    coll.insert(Key::Str("C".into()), emp("C", 55_000i64, 1));
    coll.insert(Key::Str("D".into()), emp("D", 65_000i64, 2));
    coll.insert(Key::Str("E".into()), emp("E", 52_000i64, 1));
    let coll = Rc::new(coll);

    let sources = sources(&[("employees", coll.clone())]);
    let query =
        LiveQuery::new(&salary_desc_query(1, 2), &sources, ResultCollection::new()).unwrap();
    assert!(query.is_ready());
    assert_eq!(salaries(&query), [("B".to_string(), 60_000), ("C".to_string(), 55_000)]);

    coll.delete(&Key::Str("B".into()));
    assert_eq!(salaries(&query), [("C".to_string(), 55_000), ("E".to_string(), 52_000)]);
}

#[test]
fn grouped_aggregate_order() {
    let docs = MemoryCollection::new("vehicle_docs").with_key_field("id");
    let doc = |id: i64, vin: i64, t: i64| {
        let mut r = Record::new();
        r.set("id", Value::Int(id));
        r.set("vin", Value::Int(vin));
        r.set("t", Value::Int(t));
        Value::Record(r)
    };
    docs.insert(Key::Int(1), doc(1, 1, 1));
    docs.insert(Key::Int(2), doc(2, 2, 2));
    docs.insert(Key::Int(3), doc(3, 1, 5));
    let docs = Rc::new(docs);

    let mut ir = QueryIr::from_collection("vehicle_docs", "doc");
    ir.group_by = Some(GroupBy {
        keys: vec![("vin".into(), Expr::col("doc", "vin"))],
        aggregates: vec![AggregateExpr {
            name: "max_t".into(),
            kind: AggregateKind::Max,
            arg: Some(Expr::col("doc", "t")),
        }],
    });
    ir.order_by
        .push(OrderByKey::new(Expr::col("", "max_t"), SortSpec::desc()));
    ir.limit = Some(10);

    let sources = sources(&[("vehicle_docs", docs.clone())]);
    let query = LiveQuery::new(&ir, &sources, ResultCollection::new()).unwrap();

    let rows = |q: &LiveQuery| -> Vec<(i64, i64)> {
        q.results()
            .into_iter()
            .map(|(_, v)| {
                let r = v.as_record().unwrap();
                (
                    r.get("vin").and_then(Value::as_int).unwrap(),
                    r.get("max_t").and_then(Value::as_int).unwrap(),
                )
            })
            .collect()
    };
    assert_eq!(rows(&query), [(1, 5), (2, 2)]);

    docs.insert(Key::Int(4), doc(4, 3, 3));
    assert_eq!(rows(&query), [(1, 5), (3, 3), (2, 2)]);
}

#[test]
fn nulls_first_ordering() {
    let coll = MemoryCollection::new("employees").with_key_field("id");
    let rows: [(&str, Value); 6] = [
        ("A", Value::Int(50_000)),
        ("B", Value::Null),
        ("C", Value::Int(55_000)),
        ("D", Value::Int(65_000)),
        ("E", Value::Int(52_000)),
        ("F", Value::Null),
    ];
    for (name, salary) in rows {
        coll.insert(Key::Str(name.into()), emp(name, salary, 1));
    }
    let coll = Rc::new(coll);

    let mut ir = QueryIr::from_collection("employees", "emp");
    ir.order_by.push(OrderByKey::new(
        Expr::col("emp", "salary"),
        SortSpec::asc().nulls(NullsOrder::First),
    ));
    let sources = sources(&[("employees", coll)]);
    let query = LiveQuery::new(&ir, &sources, ResultCollection::new()).unwrap();

    let observed: Vec<Option<i64>> = query
        .results()
        .into_iter()
        .map(|(_, v)| v.as_record().unwrap().get("salary").and_then(Value::as_int))
        .collect();
    assert_eq!(
        observed,
        [None, None, Some(50_000), Some(52_000), Some(55_000), Some(65_000)]
    );
}

#[test]
fn lazy_inner_join_loads_on_demand() {
    let coll = employees();
    let depts = MemoryCollection::new("departments").with_key_field("id");
    let dept = |id: i64, name: &str| {
        let mut r = Record::new();
        r.set("id", Value::Int(id));
        r.set("name", Value::from(name));
        Value::Record(r)
    };
    depts.insert(Key::Int(1), dept(1, "eng"));
    depts.insert(Key::Int(2), dept(2, "sales"));
    depts.insert(Key::Int(3), dept(3, "unreferenced"));
    let depts = Rc::new(depts);

    let mut ir = QueryIr::from_collection("employees", "emp");
    ir.joins.push(JoinClause {
        collection: CollectionRef::new("departments", "dept"),
        kind: JoinKind::Inner,
        left: Expr::col("emp", "dept_id"),
        right: Expr::col("dept", "id"),
    });
    ir.select = Some(vec![
        ("name".into(), Expr::col("emp", "name")),
        ("dept".into(), Expr::col("dept", "name")),
    ]);

    let sources = sources(&[("employees", coll.clone()), ("departments", depts.clone())]);
    let query = LiveQuery::new(&ir, &sources, ResultCollection::new()).unwrap();
    assert!(query.is_ready());
    assert_eq!(query.len(), 5);

    // A change to a department no employee references is masked out.
    depts.update(Key::Int(3), dept(3, "renamed"));
    assert_eq!(query.len(), 5);
    assert!(query.error().is_none());

    // A change to a loaded department flows through.
    depts.update(Key::Int(1), dept(1, "engineering"));
    let renamed = query
        .results()
        .into_iter()
        .filter(|(_, v)| {
            v.as_record().unwrap().get("dept") == Some(&Value::from("engineering"))
        })
        .count();
    assert_eq!(renamed, 3);
}

#[test]
fn lazy_join_sees_late_arriving_inner_row() {
    let coll = employees();
    let depts = MemoryCollection::new("departments").with_key_field("id");
    let depts = Rc::new(depts);

    let mut ir = QueryIr::from_collection("employees", "emp");
    ir.joins.push(JoinClause {
        collection: CollectionRef::new("departments", "dept"),
        kind: JoinKind::Inner,
        left: Expr::col("emp", "dept_id"),
        right: Expr::col("dept", "id"),
    });

    let sources = sources(&[("employees", coll.clone()), ("departments", depts.clone())]);
    let query = LiveQuery::new(&ir, &sources, ResultCollection::new()).unwrap();
    assert!(query.is_empty());

    // The demanded key arrives later; masked inserts must still pass.
    let mut r = Record::new();
    r.set("id", Value::Int(1));
    r.set("name", Value::from("eng"));
    depts.insert(Key::Int(1), Value::Record(r));
    assert_eq!(query.len(), 3);
}

#[test]
fn left_join_pads_missing_inner() {
    let coll = employees();
    let depts = MemoryCollection::new("departments").with_key_field("id");
    let dept = |id: i64, name: &str| {
        let mut r = Record::new();
        r.set("id", Value::Int(id));
        r.set("name", Value::from(name));
        Value::Record(r)
    };
    depts.insert(Key::Int(1), dept(1, "eng"));
    let depts = Rc::new(depts);

    let mut ir = QueryIr::from_collection("employees", "emp");
    ir.joins.push(JoinClause {
        collection: CollectionRef::new("departments", "dept"),
        kind: JoinKind::Left,
        left: Expr::col("emp", "dept_id"),
        right: Expr::col("dept", "id"),
    });
    ir.select = Some(vec![
        ("name".into(), Expr::col("emp", "name")),
        ("dept".into(), Expr::col("dept", "name")),
    ]);

    let sources = sources(&[("employees", coll.clone()), ("departments", depts.clone())]);
    let query = LiveQuery::new(&ir, &sources, ResultCollection::new()).unwrap();

    // All five employees survive; dept 2 members are padded with null.
    assert_eq!(query.len(), 5);
    let padded = query
        .results()
        .into_iter()
        .filter(|(_, v)| v.as_record().unwrap().get("dept") == Some(&Value::Null))
        .count();
    assert_eq!(padded, 2);

    // The missing department arrives: padding retracts in place.
    depts.insert(Key::Int(2), dept(2, "sales"));
    assert_eq!(query.len(), 5);
    let padded = query
        .results()
        .into_iter()
        .filter(|(_, v)| v.as_record().unwrap().get("dept") == Some(&Value::Null))
        .count();
    assert_eq!(padded, 0);
}

#[test]
fn where_pushdown_still_refiltered() {
    let coll = employees();
    let sources = sources(&[("employees", coll.clone())]);
    let mut ir = QueryIr::from_collection("employees", "emp");
    ir.where_clause = Some(Expr::col("emp", "salary").ge(Expr::lit(55_000i64)));
    let query = LiveQuery::new(&ir, &sources, ResultCollection::new()).unwrap();
    assert_eq!(query.len(), 3);

    // Updates moving rows across the predicate boundary work both ways.
    coll.update(Key::Str("A".into()), emp("A", 56_000i64, 1));
    assert_eq!(query.len(), 4);
    coll.update(Key::Str("B".into()), emp("B", 10_000i64, 2));
    assert_eq!(query.len(), 3);
}

#[test]
fn empty_source_marks_ready() {
    let coll = Rc::new(MemoryCollection::new("employees").with_key_field("id"));
    let sources = sources(&[("employees", coll)]);
    let sink = ResultCollection::new();
    let query = LiveQuery::new(
        &QueryIr::from_collection("employees", "emp"),
        &sources,
        sink.clone(),
    )
    .unwrap();
    assert!(query.is_empty());
    assert!(query.is_ready());
    assert!(sink.is_ready());
}

#[test]
fn limit_zero_is_empty() {
    let coll = employees();
    let sources = sources(&[("employees", coll.clone())]);
    let query =
        LiveQuery::new(&salary_desc_query(0, 0), &sources, ResultCollection::new()).unwrap();
    assert!(query.is_empty());
    assert!(query.is_ready());

    coll.insert(Key::Str("G".into()), emp("G", 99_000i64, 1));
    assert!(query.is_empty());
}

#[test]
fn all_ties_order_by_row_key() {
    let coll = MemoryCollection::new("employees").with_key_field("id");
    for name in ["c", "a", "b"] {
        coll.insert(Key::Str(name.into()), emp(name, 50_000i64, 1));
    }
    let coll = Rc::new(coll);

    let mut ir = QueryIr::from_collection("employees", "emp");
    ir.order_by
        .push(OrderByKey::new(Expr::col("emp", "salary"), SortSpec::asc()));
    let sources = sources(&[("employees", coll.clone())]);
    let query = LiveQuery::new(&ir, &sources, ResultCollection::new()).unwrap();

    let names: Vec<String> = query
        .results()
        .iter()
        .map(|(k, _)| k.as_str().unwrap().to_string())
        .collect();
    assert_eq!(names, ["a", "b", "c"]);

    // Still stable after an unrelated change.
    coll.insert(Key::Str("d".into()), emp("d", 50_000i64, 1));
    let names: Vec<String> = query
        .results()
        .iter()
        .map(|(k, _)| k.as_str().unwrap().to_string())
        .collect();
    assert_eq!(names, ["a", "b", "c", "d"]);
}

#[test]
fn reinsert_same_value_changes_nothing() {
    let coll = employees();
    let sources = sources(&[("employees", coll.clone())]);
    let sink = ResultCollection::new();
    let query = LiveQuery::new(&salary_desc_query(1, 2), &sources, sink.clone()).unwrap();
    let before = salaries(&query);

    coll.insert(Key::Str("C".into()), emp("C", 55_000i64, 1));
    assert_eq!(salaries(&query), before);
}

#[test]
fn close_stops_maintenance() {
    let coll = employees();
    let sources = sources(&[("employees", coll.clone())]);
    let mut query =
        LiveQuery::new(&salary_desc_query(1, 2), &sources, ResultCollection::new()).unwrap();
    let before = salaries(&query);

    query.close();
    coll.insert(Key::Str("G".into()), emp("G", 99_000i64, 1));
    assert_eq!(salaries(&query), before);
}

#[test]
fn unknown_collection_fails_compile() {
    let sources = sources(&[]);
    let err = LiveQuery::new(
        &QueryIr::from_collection("missing", "m"),
        &sources,
        ResultCollection::new(),
    )
    .unwrap_err();
    assert!(err.is_compile());
}

#[test]
fn compare_matches_declared_order() {
    let coll = employees();
    let sources = sources(&[("employees", coll.clone())]);
    let query =
        LiveQuery::new(&salary_desc_query(0, 5), &sources, ResultCollection::new()).unwrap();

    let keys: Vec<Key> = query.results().into_iter().map(|(k, _)| k).collect();
    for pair in keys.windows(2) {
        assert_eq!(query.compare(&pair[0], &pair[1]), core::cmp::Ordering::Less);
    }
}
