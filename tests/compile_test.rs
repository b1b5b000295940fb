use pretty_assertions::assert_eq;
use relq::prelude::*;
use std::sync::Arc;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Collapse every whitespace run to one space.
fn normalize(sql: &str) -> String {
    sql.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn compile(query: &Query) -> String {
    normalize(&query.to_sql().expect("query should compile"))
}

struct Transit {
    schema: Arc<Schema>,
    trips: RelationId,
    stops: RelationId,
}

impl Transit {
    fn new() -> Self {
        let mut schema = Schema::new();
        let trips = schema.add_table("trips");
        let stops = schema.add_table("stops");
        schema.has_many(trips, stops, AssociationOptions::default()).unwrap();
        schema.belongs_to(stops, trips, AssociationOptions::default()).unwrap();
        Self {
            schema: Arc::new(schema),
            trips,
            stops,
        }
    }

    fn trips(&self) -> Query {
        self.schema.query(self.trips).unwrap()
    }

    fn stops(&self) -> Query {
        self.schema.query(self.stops).unwrap()
    }

    fn stops_ref(&self) -> RelationRef {
        self.schema.reference(self.stops).unwrap()
    }
}

fn blah() -> Query {
    Query::from_table("blah", TableOptions::default())
}

#[test]
fn test_select_star_from_table() {
    init_tracing();
    assert_eq!(compile(&blah()), r#"SELECT * FROM "blah" AS "blah""#);
}

#[test]
fn test_where_column_equals_number() {
    let query = blah().filter(|row| Ok(row.col("x").eq(100)));
    assert_eq!(
        compile(&query),
        r#"SELECT * FROM "blah" AS "blah" WHERE "blah"."x" = (100)"#
    );
}

#[test]
fn test_select_columns_with_alias() {
    let query = blah().select([
        SelectArg::from("col1"),
        SelectArg::from("col2"),
        SelectArg::aliased("col3", "bar"),
    ]);
    assert_eq!(
        compile(&query),
        r#"SELECT "blah"."col1", "blah"."col2", "blah"."col3" AS "bar" FROM "blah" AS "blah""#
    );
}

#[test]
fn test_fetch_aggregate_becomes_correlated_subquery() {
    init_tracing();
    let transit = Transit::new();
    let query = transit
        .trips()
        .filter(|t| Ok(t.fetch("stops")?.min("x").lt("07:00")));
    assert_eq!(
        compile(&query),
        r#"SELECT * FROM "trips" AS "trips" WHERE (SELECT MIN("stops"."x") AS "min" FROM "stops" AS "stops" WHERE "trips"."id" = ("stops"."tripsId")) < ('07:00')"#
    );
}

#[test]
fn test_sibling_queries_compile_independently() {
    let base = blah();
    let big = base.filter(|row| Ok(row.col("x").gt(100)));
    let small = base.filter(|row| Ok(row.col("x").lt(10)));

    assert_eq!(
        compile(&big),
        r#"SELECT * FROM "blah" AS "blah" WHERE "blah"."x" > (100)"#
    );
    assert_eq!(
        compile(&small),
        r#"SELECT * FROM "blah" AS "blah" WHERE "blah"."x" < (10)"#
    );
    assert_eq!(compile(&base), r#"SELECT * FROM "blah" AS "blah""#);
}

#[test]
fn test_builder_calls_leave_receiver_unchanged() {
    let transit = Transit::new();
    let base = transit.trips().filter(|t| Ok(t.col("x").gte(1)));
    let before = compile(&base);

    let _ = base.select(["a"]);
    let _ = base.and_select(["b"]);
    let _ = base.order_by(|t| Ok(vec![OrderBy::asc(t.col("a"))]));
    let _ = base.limit(1).named("q").include(transit.stops());
    let _ = base.join("stops", JoinOptions::new()).unwrap();
    let _ = base.join(transit.stops(), JoinOptions::new()).unwrap();

    assert_eq!(compile(&base), before);
}

#[test]
fn test_and_select_keeps_star() {
    let query = blah().and_select(["x"]);
    assert_eq!(
        compile(&query),
        r#"SELECT *, "blah"."x" FROM "blah" AS "blah""#
    );
    assert_eq!(compile(&query.select_none()), r#"SELECT * FROM "blah" AS "blah""#);
}

#[test]
fn test_join_association() {
    let transit = Transit::new();
    let query = transit.trips().join("stops", JoinOptions::new()).unwrap();
    assert_eq!(
        compile(&query),
        r#"SELECT * FROM "trips" AS "trips" INNER JOIN "stops" AS "stops" ON "trips"."id" = ("stops"."tripsId")"#
    );
}

#[test]
fn test_association_predicate_is_symmetric() {
    let transit = Transit::new();
    let forward = compile(&transit.trips().join("stops", JoinOptions::new()).unwrap());
    let backward = compile(&transit.stops().join("trips", JoinOptions::new()).unwrap());

    let on = |sql: &str| sql.split(" ON ").nth(1).map(str::to_string);
    assert_eq!(on(&forward), Some(r#""trips"."id" = ("stops"."tripsId")"#.to_string()));
    assert_eq!(on(&forward), on(&backward));
}

#[test]
fn test_flattened_join_matches_direct_join() {
    let transit = Transit::new();
    let target = transit.stops().filter(|s| Ok(s.col("x").gt(1)));

    let flattened = transit.trips().join(target.clone(), JoinOptions::new()).unwrap();
    let direct = transit
        .trips()
        .join(transit.stops_ref(), JoinOptions::new())
        .unwrap()
        .filter(|t| Ok(t.col_of("stops", "x").gt(1)));

    let expected = r#"SELECT * FROM "trips" AS "trips" INNER JOIN "stops" AS "stops" ON "trips"."id" = ("stops"."tripsId") WHERE "stops"."x" > (1)"#;
    assert_eq!(compile(&flattened), expected);
    assert_eq!(compile(&direct), expected);

    let renamed = transit
        .trips()
        .join(target, JoinOptions::new().alias("s"))
        .unwrap();
    assert_eq!(
        compile(&renamed),
        r#"SELECT * FROM "trips" AS "trips" INNER JOIN "stops" AS "s" ON "trips"."id" = ("s"."tripsId") WHERE "s"."x" > (1)"#
    );
}

#[test]
fn test_flattened_selections_are_prefixed() {
    let transit = Transit::new();
    let query = transit
        .trips()
        .select(["id"])
        .join(transit.stops().select(["name"]), JoinOptions::new())
        .unwrap();
    assert_eq!(
        compile(&query),
        r#"SELECT "trips"."id", "stops"."name" AS "stops.name" FROM "trips" AS "trips" INNER JOIN "stops" AS "stops" ON "trips"."id" = ("stops"."tripsId")"#
    );

    let all = transit
        .trips()
        .select(["id"])
        .join(transit.stops(), JoinOptions::new())
        .unwrap();
    assert!(compile(&all).starts_with(r#"SELECT "trips"."id", "stops".* FROM"#));
}

#[test]
fn test_filtered_left_join_becomes_cte() {
    init_tracing();
    let transit = Transit::new();
    let target = transit.stops().filter(|s| Ok(s.col("x").gt(1)));
    let query = transit
        .trips()
        .join(target, JoinOptions::new().kind(JoinKind::Left))
        .unwrap();
    assert_eq!(
        compile(&query),
        r#"WITH "stops_0" AS ( SELECT * FROM "stops" AS "stops" WHERE "stops"."x" > (1) ) SELECT * FROM "trips" AS "trips" LEFT JOIN "stops_0" AS "stops_0" ON "trips"."id" = ("stops_0"."tripsId")"#
    );
}

#[test]
fn test_cte_name_never_shadows_a_table() {
    let transit = Transit::new();
    let target = transit.stops().filter(|s| Ok(s.col("x").gt(1)));
    let query = transit
        .trips()
        .join(target, JoinOptions::new().kind(JoinKind::Left))
        .unwrap()
        .filter(|t| Ok(t.fetch_from("trips", "stops", None)?.count("id").gt(0)));

    let sql = compile(&query);
    assert!(sql.starts_with(r#"WITH "stops_0" AS ( SELECT * FROM "stops" AS "stops" WHERE"#));
    assert!(!sql.contains(r#"WITH "stops" AS"#));
    assert!(sql.contains(r#"LEFT JOIN "stops_0" AS "stops_0""#));
    // The correlated count reads the table, not the filtered CTE.
    assert!(sql.contains(r#"FROM "stops" AS "stops_0_0""#));
    assert!(!sql.contains(r#"FROM "stops_0""#));
}

#[test]
fn test_aliases_unique_across_ctes() {
    let transit = Transit::new();
    let recent = transit.trips().limit(1).named("recent");
    let query = transit
        .trips()
        .join(
            recent,
            JoinOptions::new().on(|t| Ok(t.col("id").eq(t.col_of("recent", "id")))),
        )
        .unwrap();
    assert_eq!(
        compile(&query),
        r#"WITH "recent" AS ( SELECT * FROM "trips" AS "trips_0" LIMIT 1 ) SELECT * FROM "trips" AS "trips" INNER JOIN "recent" AS "recent" ON "trips"."id" = ("recent"."id")"#
    );
}

#[test]
fn test_nested_ctes_are_ordered_children_first() {
    let transit = Transit::new();
    let inner = transit.stops().limit(5).named("inner");
    let middle = transit
        .trips()
        .join(inner, JoinOptions::new().on(|_| Ok(literal("TRUE"))))
        .unwrap()
        .limit(2)
        .named("middle");
    let query = blah()
        .join(middle, JoinOptions::new().on(|_| Ok(literal("TRUE"))))
        .unwrap();

    let sql = query.to_sql().unwrap();
    let inner_at = sql.find("\"inner\" AS (").unwrap();
    let middle_at = sql.find("\"middle\" AS (").unwrap();
    assert!(inner_at < middle_at);
    assert!(sql.starts_with("WITH "));
    assert_eq!(sql.matches("WITH").count(), 1);
}

#[test]
fn test_subquery_display_alias_shadows_outer() {
    let transit = Transit::new();
    let query = transit
        .trips()
        .select_with(|t| Ok(vec![Selection::aliased(t.count("id"), "total")]));
    assert_eq!(
        compile(&query),
        r#"SELECT (SELECT COUNT("trips_0"."id") AS "count" FROM "trips" AS "trips_0") AS "total" FROM "trips" AS "trips""#
    );
}

#[test]
fn test_chained_fetch_joins_into_one_subquery() {
    let transit = Transit::new();
    let query = transit
        .stops()
        .filter(|s| Ok(s.fetch("trips")?.fetch("stops")?.count("id").gt(3)));
    assert_eq!(
        compile(&query),
        r#"SELECT * FROM "stops" AS "stops" WHERE (SELECT COUNT("stops_0"."id") AS "count" FROM "trips" AS "trips" INNER JOIN "stops" AS "stops_0" ON "trips"."id" = ("stops_0"."tripsId") WHERE "trips"."id" = ("stops"."tripsId")) > (3)"#
    );
}

#[test]
fn test_exists_with_narrowed_fetch() {
    let transit = Transit::new();
    let query = transit.trips().filter(|t| {
        Ok(t.fetch("stops")?
            .filter(|s| Ok(s.col("x").eq(5)))
            .exists())
    });
    assert_eq!(
        compile(&query),
        r#"SELECT * FROM "trips" AS "trips" WHERE EXISTS (SELECT 1 FROM "stops" AS "stops" WHERE ("trips"."id" = ("stops"."tripsId")) AND ("stops"."x" = (5)))"#
    );
}

#[test]
fn test_standalone_subquery_inlines_with_clause() {
    let transit = Transit::new();
    let inner = transit
        .trips()
        .join(transit.stops().limit(2), JoinOptions::new())
        .unwrap();
    let sql = Expression::subquery(inner).to_sql(&Scope::new()).unwrap();
    assert_eq!(
        normalize(&sql),
        r#"(WITH "stops_0" AS ( SELECT * FROM "stops" AS "stops" LIMIT 2 ) SELECT * FROM "trips" AS "trips" INNER JOIN "stops_0" AS "stops_0" ON "trips"."id" = ("stops_0"."tripsId"))"#
    );
}

#[test]
fn test_order_by_and_limit_render() {
    let query = blah()
        .order_by(|row| Ok(vec![OrderBy::desc(row.col("x"))]))
        .limit(3);
    assert_eq!(
        compile(&query),
        r#"SELECT * FROM "blah" AS "blah" ORDER BY "blah"."x" DESC LIMIT 3"#
    );
}

#[test]
fn test_unresolved_source_aborts_compile() {
    let query = blah().filter(|row| Ok(row.col_of("ghost", "x").eq(1)));
    let err = query.to_sql().unwrap_err();
    assert!(matches!(err, RelqError::UnresolvedSource(s) if s == "ghost"));
}

#[test]
fn test_unknown_association_aborts_compile() {
    let transit = Transit::new();
    let query = transit
        .trips()
        .filter(|t| Ok(t.fetch("drivers")?.count("id").gt(0)));
    let err = query.to_sql().unwrap_err();
    assert!(matches!(
        err,
        RelqError::UnknownAssociation { relation, association }
            if relation == "trips" && association == "drivers"
    ));
}

#[test]
fn test_callback_errors_propagate() {
    let query = blah().filter(|row| Expression::binary(&["", " ~ "], row.col("x"), "a.*"));
    let err = query.to_sql().unwrap_err();
    assert!(matches!(err, RelqError::MalformedBinaryOp { fragments: 2 }));
}

#[test]
fn test_schema_file_drives_joins() {
    let schema = Schema::from_toml_str(
        r#"
        [[relations]]
        name = "persons"

        [[relations]]
        name = "pets"

        [[associations]]
        kind = "has_many"
        owner = "persons"
        target = "pets"
        foreign_key = "ownerId"

        [[associations]]
        kind = "belongs_to"
        owner = "pets"
        target = "persons"
        as = "owner"
        foreign_key = "ownerId"
        "#,
    )
    .unwrap();
    let schema = Arc::new(schema);
    let persons = schema.relation_by_name("persons").unwrap();
    let pets = schema.relation_by_name("pets").unwrap();

    let query = schema
        .query(persons)
        .unwrap()
        .join("pets", JoinOptions::new())
        .unwrap();
    assert_eq!(
        compile(&query),
        r#"SELECT * FROM "persons" AS "persons" INNER JOIN "pets" AS "pets" ON "persons"."id" = ("pets"."ownerId")"#
    );

    let named = schema
        .query(pets)
        .unwrap()
        .filter(|p| Ok(p.fetch("owner")?.max("age").gt(30)));
    assert_eq!(
        compile(&named),
        r#"SELECT * FROM "pets" AS "pets" WHERE (SELECT MAX("owner"."age") AS "max" FROM "persons" AS "owner" WHERE "owner"."id" = ("pets"."ownerId")) > (30)"#
    );
}
