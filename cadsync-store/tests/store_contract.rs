use cadsync_core::crs::CoordinateReference;
use cadsync_core::geometry::Point3;
use cadsync_core::model::{
    Drawing, DrawingId, ExportJob, JobStatus, Layer, LayerId, PrimitiveEntity, PrimitiveKind,
    Shape, Space, StandardAttributes, StandardCategory, StandardEntry, StyleOverrides,
};
use cadsync_core::style::{Color, LineWeight};
use cadsync_store::{MemoryStore, SqliteStore, Store, StoreError};

fn stores() -> Vec<(&'static str, Box<dyn Store>, Option<tempfile::TempDir>)> {
    let dir = tempfile::tempdir().expect("创建临时目录失败");
    let sqlite = SqliteStore::open(dir.path().join("cadsync.db")).expect("打开数据库失败");
    vec![
        ("memory", Box::new(MemoryStore::new()) as Box<dyn Store>, None),
        ("sqlite", Box::new(sqlite), Some(dir)),
    ]
}

fn layer(drawing: DrawingId, name: &str) -> Layer {
    Layer {
        drawing_id: drawing,
        name: name.to_string(),
        color: Color::RED,
        line_style: None,
        line_weight: LineWeight::ByLayer,
        frozen: false,
        locked: false,
        standard: None,
        handle: None,
    }
}

fn line(drawing: DrawingId, layer_id: LayerId) -> PrimitiveEntity {
    PrimitiveEntity {
        drawing_id: drawing,
        layer_id,
        kind: PrimitiveKind::Line,
        shape: Shape::Path(vec![Point3::origin(), Point3::new(1.0, 1.0, 0.0)]),
        crs: CoordinateReference::tagged("EPSG:2230", "CA VI"),
        space: Space::Model,
        handle: Some("2A".to_string()),
        style: StyleOverrides::default(),
    }
}

fn standard(category: StandardCategory, name: &str) -> StandardEntry {
    StandardEntry::new(name, StandardAttributes::default_for(category))
}

#[test]
fn layer_names_are_unique_per_drawing() {
    for (label, store, _guard) in stores() {
        let mut tx = store.begin().expect("开启事务失败");
        let a = tx.insert_drawing(&Drawing::new("A")).expect("插入图纸失败");
        let b = tx.insert_drawing(&Drawing::new("B")).expect("插入图纸失败");
        tx.insert_layer(&layer(a, "C-STORM")).expect("插入图层失败");
        tx.insert_layer(&layer(b, "C-STORM"))
            .expect("不同图纸允许同名图层");
        let err = tx
            .insert_layer(&layer(a, "C-STORM"))
            .expect_err("同一图纸内图层必须唯一");
        assert!(err.is_unique_violation(), "{label}: {err}");
        // 冲突后事务仍可继续使用
        let (found, stored) = tx
            .find_layer(a, "C-STORM")
            .expect("查询失败")
            .expect("图层应存在");
        assert_eq!(stored.color, Color::RED, "{label}");
        assert_eq!(tx.layers(a).expect("列表失败").len(), 1, "{label}");
        assert_eq!(tx.layer(found).expect("读取失败"), Some(stored), "{label}");
        tx.commit().expect("提交失败");
    }
}

#[test]
fn registry_entries_are_unique_per_category() {
    for (label, store, _guard) in stores() {
        let mut tx = store.begin().expect("开启事务失败");
        let id = tx
            .insert_standard(&standard(StandardCategory::Layer, "C-STORM"))
            .expect("插入标准失败");
        tx.insert_standard(&standard(StandardCategory::Symbol, "C-STORM"))
            .expect("不同类别允许同名");
        let err = tx
            .insert_standard(&standard(StandardCategory::Layer, "C-STORM"))
            .expect_err("同类别必须唯一");
        assert!(err.is_unique_violation(), "{label}: {err}");

        tx.add_standard_usage(id, 3).expect("计数失败");
        tx.commit().expect("提交失败");

        let mut tx = store.begin().expect("开启事务失败");
        let (found, entry) = tx
            .find_standard(StandardCategory::Layer, "C-STORM")
            .expect("查询失败")
            .expect("标准应存在");
        assert_eq!(found, id, "{label}");
        assert_eq!(entry.usage_count, 3, "{label}");
        assert_eq!(entry.category(), StandardCategory::Layer, "{label}");
    }
}

#[test]
fn registry_listing_orders_by_usage() {
    for (label, store, _guard) in stores() {
        let mut tx = store.begin().expect("开启事务失败");
        let rare = tx
            .insert_standard(&standard(StandardCategory::FillPattern, "ANSI31"))
            .expect("插入失败");
        let common = tx
            .insert_standard(&standard(StandardCategory::FillPattern, "SOLID"))
            .expect("插入失败");
        tx.insert_standard(&standard(StandardCategory::FillPattern, "AR-CONC"))
            .expect("插入失败");
        tx.add_standard_usage(common, 5).expect("计数失败");
        tx.add_standard_usage(rare, 1).expect("计数失败");
        let names: Vec<String> = tx
            .standards(StandardCategory::FillPattern)
            .expect("列表失败")
            .into_iter()
            .map(|(_, entry)| entry.name)
            .collect();
        assert_eq!(names, vec!["SOLID", "ANSI31", "AR-CONC"], "{label}");
        assert!(
            tx.standards(StandardCategory::Symbol)
                .expect("列表失败")
                .is_empty()
        );
    }
}

#[test]
fn rolled_back_transaction_leaves_no_rows() {
    for (label, store, _guard) in stores() {
        {
            let mut tx = store.begin().expect("开启事务失败");
            let drawing = tx.insert_drawing(&Drawing::new("A")).expect("插入图纸失败");
            let layer_id = tx.insert_layer(&layer(drawing, "0")).expect("插入图层失败");
            tx.insert_primitive(&line(drawing, layer_id))
                .expect("插入图元失败");
            tx.rollback().expect("回滚失败");
        }
        {
            let mut tx = store.begin().expect("开启事务失败");
            tx.insert_drawing(&Drawing::new("dropped"))
                .expect("插入图纸失败");
            // 未提交即释放
        }
        let mut tx = store.begin().expect("开启事务失败");
        assert!(tx.drawings().expect("列表失败").is_empty(), "{label}");
    }
}

#[test]
fn children_must_reference_a_layer_of_the_same_drawing() {
    for (label, store, _guard) in stores() {
        let mut tx = store.begin().expect("开启事务失败");
        let a = tx.insert_drawing(&Drawing::new("A")).expect("插入图纸失败");
        let b = tx.insert_drawing(&Drawing::new("B")).expect("插入图纸失败");
        let layer_b = tx.insert_layer(&layer(b, "0")).expect("插入图层失败");
        let err = tx
            .insert_primitive(&line(a, layer_b))
            .expect_err("跨图纸引用图层应失败");
        assert!(matches!(err, StoreError::Integrity(_)), "{label}: {err}");
        let err = tx
            .insert_layer(&layer(DrawingId::new(9_999), "0"))
            .expect_err("图纸不存在");
        assert!(matches!(err, StoreError::NotFound { .. }), "{label}: {err}");
    }
}

#[test]
fn deleting_a_drawing_cascades() {
    for (label, store, _guard) in stores() {
        let mut tx = store.begin().expect("开启事务失败");
        let keep = tx.insert_drawing(&Drawing::new("keep")).expect("插入图纸失败");
        let doomed = tx.insert_drawing(&Drawing::new("doomed")).expect("插入图纸失败");
        for drawing in [keep, doomed] {
            let layer_id = tx.insert_layer(&layer(drawing, "0")).expect("插入图层失败");
            tx.insert_primitive(&line(drawing, layer_id))
                .expect("插入图元失败");
        }
        tx.commit().expect("提交失败");

        let mut tx = store.begin().expect("开启事务失败");
        assert!(tx.delete_drawing(doomed).expect("删除失败"), "{label}");
        assert!(!tx.delete_drawing(doomed).expect("删除失败"), "{label}");
        tx.commit().expect("提交失败");

        let mut tx = store.begin().expect("开启事务失败");
        let gone = tx.counts(doomed).expect("统计失败");
        assert_eq!((gone.layers, gone.primitives), (0, 0), "{label}");
        let kept = tx.counts(keep).expect("统计失败");
        assert_eq!((kept.layers, kept.primitives), (1, 1), "{label}");
        let primitives = tx.primitives(keep).expect("列表失败");
        assert_eq!(primitives[0].1.handle.as_deref(), Some("2A"), "{label}");
        assert_eq!(primitives[0].1.crs.code(), Some("EPSG:2230"), "{label}");
    }
}

#[test]
fn job_status_only_moves_forward() {
    for (label, store, _guard) in stores() {
        let mut tx = store.begin().expect("开启事务失败");
        let drawing = tx.insert_drawing(&Drawing::new("A")).expect("插入图纸失败");
        let mut job = ExportJob::pending(drawing, "R2018");
        let id = tx.insert_job(&job).expect("创建任务失败");
        tx.commit().expect("提交失败");

        let mut tx = store.begin().expect("开启事务失败");
        job.status = JobStatus::Completed;
        let err = tx.update_job(id, &job).expect_err("不能跳过 processing");
        assert!(
            matches!(err, StoreError::InvalidTransition { .. }),
            "{label}: {err}"
        );
        job.status = JobStatus::Processing;
        tx.update_job(id, &job).expect("pending -> processing");
        job.status = JobStatus::Failed;
        job.error = Some("cancelled".to_string());
        tx.update_job(id, &job).expect("processing -> failed");
        job.status = JobStatus::Completed;
        assert!(tx.update_job(id, &job).is_err(), "{label}: 终态不可修改");
        tx.commit().expect("提交失败");

        let mut tx = store.begin().expect("开启事务失败");
        let stored = tx.job(id).expect("读取失败").expect("任务应存在");
        assert_eq!(stored.status, JobStatus::Failed, "{label}");
        assert_eq!(stored.error.as_deref(), Some("cancelled"), "{label}");
    }
}

#[test]
fn sqlite_store_persists_across_reopen() {
    let dir = tempfile::tempdir().expect("创建临时目录失败");
    let path = dir.path().join("persist.db");
    let drawing = {
        let store = SqliteStore::open(&path).expect("打开数据库失败");
        let mut tx = store.begin().expect("开启事务失败");
        let drawing = tx
            .insert_drawing(&Drawing::new("site").with_crs(CoordinateReference::tagged("EPSG:2230", "CA VI")))
            .expect("插入图纸失败");
        tx.insert_standard(&standard(StandardCategory::Layer, "C-STORM"))
            .expect("插入标准失败");
        tx.commit().expect("提交失败");
        drawing
    };
    let store = SqliteStore::open(&path).expect("重新打开数据库失败");
    let mut tx = store.begin().expect("开启事务失败");
    let stored = tx.drawing(drawing).expect("读取失败").expect("图纸应存在");
    assert_eq!(stored.name, "site");
    assert_eq!(stored.crs.code(), Some("EPSG:2230"));
    assert!(
        tx.find_standard(StandardCategory::Layer, "C-STORM")
            .expect("查询失败")
            .is_some()
    );
}
