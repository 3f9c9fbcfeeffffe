use anyhow::Result;
use sqlframe::testing::{init_test_tracing, LogCapture, MockEngine};
use sqlframe::{
    AnalyticFunc, AnalyticRequest, Category, FrameConfig, FrameError, Relation, RelationSource,
};
use std::sync::Arc;

fn engine() -> MockEngine {
    MockEngine::new()
        .with_table(
            "sales",
            &[
                ("price", "float"),
                ("qty", "int"),
                ("name", "varchar(20)"),
                ("g", "int"),
                ("t", "timestamp"),
            ],
        )
        .with_type_rule("ROW_NUMBER(", "int")
        .with_type_rule("COUNT(", "int")
        .with_type_rule("NTH_VALUE(name", "varchar(20)")
}

async fn relation(engine: &Arc<MockEngine>) -> Relation {
    init_test_tracing();
    Relation::from_table(engine.clone(), "sales")
        .await
        .expect("relation over sales")
}

fn probes(engine: &MockEngine) -> Vec<String> {
    engine
        .statements()
        .into_iter()
        .map(|s| s.sql)
        .filter(|sql| sql.contains(" AS probe FROM "))
        .collect()
}

#[tokio::test]
async fn test_skewness_creates_hidden_scratch_columns() -> Result<()> {
    let engine = Arc::new(engine());
    let mut rel = relation(&engine).await;

    rel.analytic(AnalyticRequest::parse("skewness")?.columns(["PRICE"]).by(["g"]))
        .await?;

    assert_eq!(
        rel.columns(),
        vec!["price", "qty", "name", "g", "t", "skewness_price_by_g"]
    );
    assert_eq!(
        rel.exclude_columns(),
        vec!["price_mean_1", "price_std_2", "price_count_3"]
    );
    assert_eq!(rel.all_columns().len(), 9);

    let output = rel.get_column("skewness_price_by_g")?;
    assert_eq!(output.depth(), 3);
    assert_eq!(rel.get_column("price_mean_1")?.depth(), 2);

    let probes = probes(&engine);
    assert_eq!(probes.len(), 4);
    assert!(probes[0].starts_with("SELECT AVG(price) OVER (PARTITION BY g) AS probe FROM"));
    assert!(probes[3].contains("NULLIFZERO(price_std_2)"), "{}", probes[3]);

    let select = rel.select_sql();
    assert!(
        select.starts_with("SELECT price, qty, name, g, t, skewness_price_by_g FROM ("),
        "{select}"
    );
    assert!(rel
        .history()
        .last()
        .unwrap()
        .message
        .starts_with("[Analytic]: The new column 'skewness_price_by_g'"));
    assert_eq!(rel.history().len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_failed_step_rolls_back_scratch_columns() -> Result<()> {
    let engine = Arc::new(engine().with_failure("STDDEV(price)", "out of memory"));
    let mut rel = relation(&engine).await;
    let before = rel.all_columns();

    let err = rel
        .analytic(AnalyticRequest::parse("kurtosis")?.columns(["price"]).by(["g"]))
        .await
        .unwrap_err();
    assert!(matches!(err, FrameError::Query { .. }), "{err:?}");
    assert_eq!(rel.all_columns(), before);
    assert!(rel.exclude_columns().is_empty());
    assert!(rel.history().is_empty());

    // the scratch counter was rolled back too
    rel.analytic(AnalyticRequest::parse("aad")?.columns(["price"]).name("aad_price"))
        .await?;
    assert_eq!(rel.exclude_columns(), vec!["price_mean_1"]);
    assert_eq!(
        rel.get_column("aad_price")?.init_transform().to_string(),
        "AVG(ABS(price - price_mean_1)) OVER ()"
    );
    Ok(())
}

#[tokio::test]
async fn test_unknown_generic_function() -> Result<()> {
    let engine = Arc::new(engine().with_failure("FOOBAR(", "Function FOOBAR(float) does not exist"));
    let mut rel = relation(&engine).await;

    let err = rel
        .analytic(
            AnalyticRequest::parse("foobar")?
                .columns(["price"])
                .order_by(["t"]),
        )
        .await
        .unwrap_err();
    assert!(matches!(&err, FrameError::UnknownAggregate(name) if name == "foobar"));
    assert_eq!(rel.all_columns().len(), 5);

    let statements = engine.statement_count();
    let err = rel
        .analytic(AnalyticRequest::parse("drop table")?.columns(["price"]))
        .await
        .unwrap_err();
    assert!(matches!(err, FrameError::UnknownAggregate(_)));
    assert_eq!(engine.statement_count(), statements);
    Ok(())
}

#[tokio::test]
async fn test_validation_happens_before_any_sql() -> Result<()> {
    let engine = Arc::new(engine());
    let mut rel = relation(&engine).await;
    let statements = engine.statement_count();

    assert!(matches!(
        AnalyticRequest::parse("fifty%"),
        Err(FrameError::InvalidParameter(_))
    ));

    let err = rel
        .analytic(AnalyticRequest::parse("lag")?.columns(["price"]))
        .await
        .unwrap_err();
    assert!(matches!(err, FrameError::InvalidParameter(_)));

    let err = rel
        .analytic(AnalyticRequest::parse("avg")?.columns(["missing"]))
        .await
        .unwrap_err();
    assert!(matches!(err, FrameError::MissingColumn(_)));

    let err = rel
        .analytic(AnalyticRequest::parse("avg")?.columns(["price"]).name("qty"))
        .await
        .unwrap_err();
    assert!(matches!(err, FrameError::DuplicateColumn(_)));

    let err = rel
        .analytic(AnalyticRequest::parse("corr")?.columns(["price"]))
        .await
        .unwrap_err();
    assert!(matches!(err, FrameError::MissingColumn(_)));

    assert_eq!(engine.statement_count(), statements);
    assert!(rel.history().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_order_by_is_ignored_for_aggregates() -> Result<()> {
    let engine = Arc::new(engine());
    let mut rel = relation(&engine).await;

    rel.analytic(
        AnalyticRequest::parse("mean")?
            .columns(["price"])
            .order_by(["t"]),
    )
    .await?;

    let column = rel.get_column("avg_price_order_by_t")?;
    assert_eq!(column.init_transform().to_string(), "AVG(price) OVER ()");
    assert_eq!(column.category(), Category::Float);
    Ok(())
}

#[tokio::test]
async fn test_prod_and_ranking() -> Result<()> {
    let engine = Arc::new(engine());
    let mut rel = relation(&engine).await;

    rel.analytic(
        AnalyticRequest::new(AnalyticFunc::Prod)
            .columns(["qty"])
            .by(["g"])
            .name("qty_prod"),
    )
    .await?;
    let prod = rel.get_column("qty_prod")?.init_transform().to_string();
    assert!(
        prod.ends_with("* POWER(10, SUM(LOG(ABS(qty))) OVER (PARTITION BY g))"),
        "{prod}"
    );

    rel.analytic(
        AnalyticRequest::parse("row_number")?
            .by(["g"])
            .order_by(["t"]),
    )
    .await?;
    let rank = rel.get_column("row_number_by_g_order_by_t")?;
    assert_eq!(
        rank.init_transform().to_string(),
        "ROW_NUMBER() OVER (PARTITION BY g ORDER BY t ASC)"
    );
    assert_eq!(rank.category(), Category::Int);
    Ok(())
}

#[tokio::test]
async fn test_top_with_hidden_count() -> Result<()> {
    let engine = Arc::new(engine());
    let mut rel = relation(&engine).await;

    rel.analytic(
        AnalyticRequest::new(AnalyticFunc::Top { add_count: true })
            .columns(["name"])
            .by(["g"])
            .name("mode_name"),
    )
    .await?;

    assert!(rel.columns().contains(&"mode_name".to_string()));
    assert_eq!(rel.exclude_columns(), vec!["mode_name_count"]);

    let mode = rel.get_column("mode_name")?;
    assert_eq!(mode.depth(), 3);
    assert_eq!(mode.category(), Category::Text);
    assert_eq!(rel.get_column("mode_name_count")?.depth(), 3);

    let sql = rel.current_relation();
    assert!(
        sql.contains(
            "NTH_VALUE(name, 1) OVER (PARTITION BY g ORDER BY mode_name DESC) AS mode_name"
        ),
        "{sql}"
    );
    assert!(
        sql.contains("ROW_NUMBER() OVER (PARTITION BY g, name) AS mode_name"),
        "{sql}"
    );

    let messages: Vec<&str> = rel.history().iter().map(|h| h.message.as_str()).collect();
    assert_eq!(messages.len(), 2);
    assert!(messages[0].starts_with("[Apply]"));
    assert!(messages[1].starts_with("[Analytic]"));
    Ok(())
}

#[tokio::test]
async fn test_output_name_is_never_used_for_scratch() -> Result<()> {
    let engine = Arc::new(engine());
    let mut rel = relation(&engine).await;

    rel.analytic(AnalyticRequest::parse("aad")?.columns(["price"]).name("price_mean_1"))
        .await?;

    assert_eq!(rel.exclude_columns(), vec!["price_mean_2"]);
    assert_eq!(
        rel.get_column("price_mean_1")?.init_transform().to_string(),
        "AVG(ABS(price - price_mean_2)) OVER ()"
    );
    assert!(rel.columns().contains(&"price_mean_1".to_string()));
    Ok(())
}

#[tokio::test]
async fn test_top_count_name_must_be_free() -> Result<()> {
    let engine = Arc::new(engine());
    let mut rel = relation(&engine).await;
    rel.eval("mode_name_count", "1").await?;
    let statements = engine.statement_count();

    let err = rel
        .analytic(
            AnalyticRequest::new(AnalyticFunc::Top { add_count: true })
                .columns(["name"])
                .name("mode_name"),
        )
        .await
        .unwrap_err();
    assert!(matches!(&err, FrameError::DuplicateColumn(name) if name == "mode_name_count"));
    assert_eq!(engine.statement_count(), statements);
    assert!(rel.get_column("mode_name").is_err());

    rel.analytic(
        AnalyticRequest::new(AnalyticFunc::Top { add_count: false })
            .columns(["name"])
            .name("mode_name"),
    )
    .await?;
    assert!(rel.exclude_columns().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_dropping_scratch_columns_keeps_exclusions_consistent() -> Result<()> {
    let engine = Arc::new(engine());
    let mut rel = relation(&engine).await;

    rel.analytic(AnalyticRequest::parse("skewness")?.columns(["price"]))
        .await?;
    rel.analytic(AnalyticRequest::parse("mad")?.columns(["qty"]))
        .await?;
    let all = rel.all_columns();
    assert!(rel.exclude_columns().iter().all(|alias| all.contains(alias)));
    assert_eq!(rel.exclude_columns().len(), 4);

    rel.drop_columns(&["price_std_2", "qty_median_4"])?;

    let excluded = rel.exclude_columns();
    assert_eq!(excluded, vec!["price_mean_1", "price_count_3"]);
    let all = rel.all_columns();
    assert!(!all.contains(&"price_std_2".to_string()));
    assert!(!all.contains(&"qty_median_4".to_string()));
    assert!(excluded.iter().all(|alias| all.contains(alias)));
    assert!(!rel.columns().iter().any(|alias| excluded.contains(alias)));
    Ok(())
}

#[tokio::test]
async fn test_ignored_order_by_warning_follows_config() -> Result<()> {
    let engine = Arc::new(engine());
    let request = || -> Result<AnalyticRequest> {
        Ok(AnalyticRequest::parse("sum")?.columns(["qty"]).order_by(["t"]))
    };

    let (logs, guard) = LogCapture::install();
    let mut rel = Relation::new(
        engine.clone(),
        RelationSource::Table("sales".to_string()),
        FrameConfig::default(),
    )
    .await?;
    rel.analytic(request()?).await?;
    drop(guard);
    assert!(
        logs.contents().contains("doesn't need an order by clause"),
        "{}",
        logs.contents()
    );

    let (logs, guard) = LogCapture::install();
    let quiet = FrameConfig::from_yaml_str("warn_on_ignored_order_by: false")?;
    let mut rel = Relation::new(
        engine.clone(),
        RelationSource::Table("sales".to_string()),
        quiet,
    )
    .await?;
    rel.analytic(request()?).await?;
    drop(guard);
    let contents = logs.contents();
    assert!(!contents.contains("doesn't need an order by clause"), "{contents}");
    assert!(contents.contains("Analytic column committed"), "{contents}");
    assert_eq!(
        rel.get_column("sum_qty_order_by_t")?.init_transform().to_string(),
        "SUM(qty) OVER ()"
    );
    Ok(())
}
