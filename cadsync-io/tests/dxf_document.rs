use std::fs::File;
use std::path::PathBuf;

use cadsync_core::geometry::Point3;
use cadsync_io::{
    DocumentLoader, DocumentSaver, DxfDocument, DxfFacade, DxfVersion, EntityCommon, EntityData,
    EntityRecord, HatchEdge, IoError,
};

fn fixture(name: &str) -> PathBuf {
    let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    path.push("tests/data");
    path.push(name);
    path
}

fn load_fixture(name: &str) -> DxfDocument {
    let mut file = File::open(fixture(name)).expect("打开测试文件失败");
    DxfFacade::new().load(&mut file).expect("读取 DXF 失败")
}

fn load_bytes(bytes: &[u8]) -> Result<DxfDocument, IoError> {
    let mut cursor = std::io::Cursor::new(bytes.to_vec());
    DxfFacade::new().load(&mut cursor)
}

fn round_trip(document: &DxfDocument) -> (DxfDocument, Vec<String>) {
    let mut buffer = Vec::new();
    let report = DxfFacade::new()
        .save(document, &mut buffer)
        .expect("写出 DXF 失败");
    let reloaded = load_bytes(&buffer).expect("重新读取写出的 DXF 失败");
    (reloaded, report.warnings)
}

fn kinds(document: &DxfDocument) -> Vec<&'static str> {
    document
        .entities
        .iter()
        .map(|entity| entity.data.type_name())
        .collect()
}

#[test]
fn reads_header_and_tables() {
    let doc = load_fixture("site_plan.dxf");
    assert_eq!(doc.version, DxfVersion::R2018);
    assert_eq!(doc.units, Some(6));

    let walls = doc.layer("WALLS").expect("缺少 WALLS 图层");
    assert_eq!(walls.color, 1);
    assert_eq!(walls.line_type.as_deref(), Some("DASHED"));
    assert_eq!(walls.line_weight, Some(35));
    assert_eq!(walls.handle.as_deref(), Some("11"));

    let notes = doc.layer("NOTES").expect("缺少 NOTES 图层");
    assert!(notes.is_locked());
    assert!(!notes.is_frozen());
    assert_eq!(notes.true_color, Some(0x336699));

    let dashed = doc
        .line_types
        .iter()
        .find(|record| record.name == "DASHED")
        .expect("缺少 DASHED 线型");
    assert_eq!(dashed.pattern, vec![0.5, -0.25]);

    assert_eq!(doc.text_styles.len(), 2);
    let labels = &doc.text_styles[1];
    assert_eq!(labels.font, "romans.shx");
    assert!((labels.width_factor - 0.8).abs() < 1e-12);

    assert_eq!(doc.dim_styles.len(), 1);
    assert_eq!(doc.dim_styles[0].name, "ISO-25");
    assert_eq!(doc.dim_styles[0].handle.as_deref(), Some("18"));
    assert_eq!(doc.dim_styles[0].text_height, Some(2.5));
}

#[test]
fn reads_entities_and_reports_unknown_kinds() {
    let doc = load_fixture("site_plan.dxf");
    assert_eq!(
        kinds(&doc),
        vec![
            "LINE",
            "CIRCLE",
            "ARC",
            "LWPOLYLINE",
            "POINT",
            "ELLIPSE",
            "SPLINE",
            "TEXT",
            "MTEXT",
            "DIMENSION",
            "HATCH",
            "INSERT",
            "LINE",
        ]
    );
    assert_eq!(doc.skipped.len(), 1);
    assert_eq!(doc.skipped[0].kind, "3DSOLID");
    assert_eq!(doc.skipped[0].handle.as_deref(), Some("3E"));

    let circle = &doc.entities[1];
    assert_eq!(circle.common.color, Some(5));
    assert_eq!(circle.common.handle.as_deref(), Some("31"));

    match &doc.entities[3].data {
        EntityData::LwPolyline { vertices, closed } => {
            assert!(*closed);
            assert_eq!(vertices.len(), 4);
            assert!((vertices[1].bulge - 0.5).abs() < 1e-12);
        }
        other => panic!("期望 LWPOLYLINE，得到 {other:?}"),
    }
    assert_eq!(doc.entities[3].common.line_weight, Some(50));

    match &doc.entities[4].data {
        EntityData::Point { location } => assert_eq!(*location, Point3::new(1.0, 2.0, 3.0)),
        other => panic!("期望 POINT，得到 {other:?}"),
    }

    assert!(doc.entities[12].common.paper_space);
    assert!(!doc.entities[0].common.paper_space);
}

#[test]
fn reads_annotations() {
    let doc = load_fixture("site_plan.dxf");

    match &doc.entities[7].data {
        EntityData::Text {
            content,
            rotation,
            style,
            horizontal,
            vertical,
            alignment_point,
            ..
        } => {
            assert_eq!(content, "Room 101");
            assert!((rotation - 15.0).abs() < 1e-12);
            assert_eq!(style.as_deref(), Some("LABELS"));
            assert_eq!((*horizontal, *vertical), (1, 2));
            assert_eq!(*alignment_point, Some(Point3::new(2.0, 1.0, 0.0)));
        }
        other => panic!("期望 TEXT，得到 {other:?}"),
    }

    match &doc.entities[8].data {
        EntityData::MText {
            content,
            reference_width,
            ..
        } => {
            assert_eq!(content, "First line\nSecond line");
            assert_eq!(*reference_width, Some(30.0));
        }
        other => panic!("期望 MTEXT，得到 {other:?}"),
    }
    assert_eq!(doc.entities[8].common.transparency, Some(0x0200_0080));

    match &doc.entities[9].data {
        EntityData::Dimension {
            style,
            flags,
            text,
            first_point,
            second_point,
            ..
        } => {
            assert_eq!(style.as_deref(), Some("ISO-25"));
            assert_eq!(flags & 0x0F, 0);
            assert_eq!(*text, None);
            assert_eq!(*first_point, Some(Point3::origin()));
            assert_eq!(*second_point, Some(Point3::new(10.0, 0.0, 0.0)));
        }
        other => panic!("期望 DIMENSION，得到 {other:?}"),
    }
}

#[test]
fn reads_hatch_boundaries() {
    let doc = load_fixture("site_plan.dxf");
    match &doc.entities[10].data {
        EntityData::Hatch {
            pattern_name,
            solid,
            scale,
            angle,
            loops,
            ..
        } => {
            assert_eq!(pattern_name, "ANSI31");
            assert!(!solid);
            assert!((scale - 2.0).abs() < 1e-12);
            assert!((angle - 45.0).abs() < 1e-12);
            assert_eq!(loops.len(), 2);
            match loops[0].edges.as_slice() {
                [HatchEdge::Polyline { vertices, closed }] => {
                    assert!(*closed);
                    assert_eq!(vertices.len(), 4);
                }
                other => panic!("期望多段线边界，得到 {other:?}"),
            }
            assert_eq!(loops[1].edges.len(), 2);
            assert!(matches!(loops[1].edges[0], HatchEdge::Line { .. }));
            match &loops[1].edges[1] {
                HatchEdge::Arc {
                    radius,
                    end_angle,
                    counter_clockwise,
                    ..
                } => {
                    assert!((radius - 0.5).abs() < 1e-12);
                    assert!((end_angle - 180.0).abs() < 1e-12);
                    assert!(*counter_clockwise);
                }
                other => panic!("期望圆弧边，得到 {other:?}"),
            }
        }
        other => panic!("期望 HATCH，得到 {other:?}"),
    }
}

#[test]
fn reads_blocks_inserts_and_viewports() {
    let doc = load_fixture("site_plan.dxf");

    let door = doc.block("DOOR").expect("缺少 DOOR 块");
    assert!(!door.is_anonymous());
    assert_eq!(door.entities.len(), 2);
    assert_eq!(door.attribute_tags, vec!["NUMBER".to_string()]);

    let dimension_block = doc.block("*D1").expect("缺少匿名块");
    assert!(dimension_block.entities.is_empty());

    match &doc.entities[11].data {
        EntityData::Insert {
            name,
            rotation,
            attributes,
            ..
        } => {
            assert_eq!(name, "DOOR");
            assert!((rotation - 90.0).abs() < 1e-12);
            assert_eq!(attributes.len(), 1);
            assert_eq!(attributes[0].tag, "NUMBER");
            assert_eq!(attributes[0].value, "D-01");
        }
        other => panic!("期望 INSERT，得到 {other:?}"),
    }

    let paper: Vec<&EntityRecord> = doc.paper_space_block_entities().collect();
    assert_eq!(paper.len(), 1);
    assert!(paper[0].common.paper_space);
    match &paper[0].data {
        EntityData::Viewport {
            id,
            view_center,
            view_height,
            frozen_layers,
            ..
        } => {
            assert_eq!(*id, Some(2));
            assert_eq!(*view_center, Point3::new(50.0, 40.0, 0.0));
            assert!((view_height - 120.0).abs() < 1e-12);
            assert_eq!(frozen_layers, &vec!["NOTES".to_string()]);
        }
        other => panic!("期望 VIEWPORT，得到 {other:?}"),
    }
}

#[test]
fn reads_legacy_polylines() {
    let doc = load_fixture("legacy_r12.dxf");
    assert_eq!(doc.version, DxfVersion::R12);
    assert_eq!(kinds(&doc), vec!["POLYLINE", "TEXT"]);
    match &doc.entities[0].data {
        EntityData::Polyline {
            vertices,
            closed,
            is_3d,
        } => {
            assert!(*closed);
            assert!(!is_3d);
            assert_eq!(vertices.len(), 3);
            assert!((vertices[0].bulge - 1.0).abs() < 1e-12);
            assert!(vertices.iter().all(|v| (v.position.z() - 2.5).abs() < 1e-12));
        }
        other => panic!("期望 POLYLINE，得到 {other:?}"),
    }
    assert_eq!(doc.skipped.len(), 1);
    assert!(doc.skipped[0].kind.starts_with("POLYLINE"));
}

#[test]
fn malformed_input_is_rejected() {
    let mut file = File::open(fixture("truncated.dxf")).expect("打开测试文件失败");
    let err = DxfFacade::new()
        .load(&mut file)
        .expect_err("截断的文件应当失败");
    assert!(matches!(err, IoError::InvalidDocument(_)));

    let err = load_bytes(b"").expect_err("空输入应当失败");
    assert!(matches!(err, IoError::InvalidDocument(_)));

    let err = load_bytes(b"0\nSECTION\n2\nENTITIES\n0\nLINE\n10\nabc\n").expect_err("非法数值应当失败");
    assert!(matches!(err, IoError::InvalidDocument(_)));

    let err = load_bytes(b"0\nSECTION\n2\nHEADER\n9\n$ACADVER\n1\nAC1006\n0\nENDSEC\n0\nEOF\n")
        .expect_err("过旧的版本应当失败");
    assert!(matches!(err, IoError::UnsupportedFeature(_)));
}

#[test]
fn round_trip_preserves_entities_and_tables() {
    let doc = load_fixture("site_plan.dxf");
    let (reloaded, warnings) = round_trip(&doc);
    assert!(warnings.is_empty(), "R2018 不应产生降级警告：{warnings:?}");
    assert_eq!(reloaded.version, DxfVersion::R2018);
    assert_eq!(reloaded.units, Some(6));
    assert_eq!(reloaded.entities, doc.entities);
    assert_eq!(reloaded.layers, doc.layers);
    assert_eq!(
        reloaded.block("DOOR").map(|block| &block.entities),
        doc.block("DOOR").map(|block| &block.entities)
    );
    let paper_before: Vec<&EntityRecord> = doc.paper_space_block_entities().collect();
    let paper_after: Vec<&EntityRecord> = reloaded.paper_space_block_entities().collect();
    assert_eq!(paper_after, paper_before);
}

#[test]
fn r12_output_downgrades_with_warnings() {
    let mut doc = load_fixture("site_plan.dxf");
    doc.version = DxfVersion::R12;
    let (reloaded, warnings) = round_trip(&doc);

    assert_eq!(reloaded.version, DxfVersion::R12);
    for feature in ["ELLIPSE", "SPLINE", "MTEXT", "HATCH", "370", "420", "440", "331"] {
        assert!(
            warnings.iter().any(|warning| warning.contains(feature)),
            "缺少 {feature} 的降级警告：{warnings:?}"
        );
    }
    assert!(
        !warnings.iter().any(|warning| warning.starts_with("LWPOLYLINE")),
        "LWPOLYLINE 转换为 POLYLINE 是无损的"
    );

    let kinds = kinds(&reloaded);
    for modern in ["LWPOLYLINE", "ELLIPSE", "SPLINE", "MTEXT", "HATCH"] {
        assert!(!kinds.contains(&modern), "R12 输出中不应出现 {modern}");
    }
    // LWPOLYLINE、ELLIPSE、SPLINE 各一条，HATCH 的两个边界环各一条
    assert_eq!(kinds.iter().filter(|kind| **kind == "POLYLINE").count(), 5);

    let viewport = reloaded
        .paper_space_block_entities()
        .find(|entity| matches!(entity.data, EntityData::Viewport { .. }))
        .expect("缺少视口");
    match &viewport.data {
        EntityData::Viewport {
            view_center,
            view_height,
            frozen_layers,
            ..
        } => {
            assert_eq!(*view_center, Point3::new(50.0, 40.0, 0.0));
            assert!((view_height - 120.0).abs() < 1e-12);
            assert!(frozen_layers.is_empty());
        }
        _ => unreachable!(),
    }
}

#[test]
fn duplicate_handles_are_reassigned_on_write() {
    let mut doc = DxfDocument::new(DxfVersion::R2010);
    for x in [0.0, 5.0] {
        let mut common = EntityCommon::on_layer("A");
        common.handle = Some("2F".to_string());
        doc.entities.push(EntityRecord::new(
            common,
            EntityData::Line {
                start: Point3::new(x, 0.0, 0.0),
                end: Point3::new(x, 1.0, 0.0),
            },
        ));
    }
    let (reloaded, _) = round_trip(&doc);
    let handles: Vec<Option<&str>> = reloaded
        .entities
        .iter()
        .map(|entity| entity.common.handle.as_deref())
        .collect();
    assert_eq!(handles[0], Some("2F"));
    assert!(handles[1].is_some());
    assert_ne!(handles[1], Some("2F"));
    assert!(reloaded.layer("A").is_some(), "引用的图层应写入图层表");
    assert!(reloaded.layer("0").is_some());
}
