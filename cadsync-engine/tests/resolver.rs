//! 并发创建同名标准时的冲突重读。

use cadsync_core::model::{
    DimensionAnnotation, DimensionId, Drawing, DrawingCounts, DrawingId, ExportJob, HatchId,
    HatchInstance, JobId, Layer, LayerId, LayoutViewport, PlacementId, PrimitiveEntity,
    PrimitiveId, StandardAttributes, StandardCategory, StandardEntry, StandardId,
    SymbolPlacement, TextAnnotation, TextId, ViewportId,
};
use cadsync_core::style::Color;
use cadsync_engine::NameResolver;
use cadsync_store::{MemoryStore, Store, StoreError, Transaction};

/// 在第一次插入标准之前，先由另一个事务提交同名条目。
struct Racing<'a> {
    store: &'a MemoryStore,
    inner: Box<dyn Transaction + 'a>,
    rival: Option<StandardId>,
}

impl<'a> Racing<'a> {
    fn begin(store: &'a MemoryStore) -> Self {
        Self {
            store,
            inner: store.begin().expect("开启事务失败"),
            rival: None,
        }
    }
}

impl Transaction for Racing<'_> {
    fn insert_drawing(&mut self, drawing: &Drawing) -> Result<DrawingId, StoreError> {
        self.inner.insert_drawing(drawing)
    }

    fn drawing(&mut self, id: DrawingId) -> Result<Option<Drawing>, StoreError> {
        self.inner.drawing(id)
    }

    fn update_drawing(&mut self, id: DrawingId, drawing: &Drawing) -> Result<(), StoreError> {
        self.inner.update_drawing(id, drawing)
    }

    fn delete_drawing(&mut self, id: DrawingId) -> Result<bool, StoreError> {
        self.inner.delete_drawing(id)
    }

    fn drawings(&mut self) -> Result<Vec<(DrawingId, Drawing)>, StoreError> {
        self.inner.drawings()
    }

    fn find_layer(
        &mut self,
        drawing: DrawingId,
        name: &str,
    ) -> Result<Option<(LayerId, Layer)>, StoreError> {
        self.inner.find_layer(drawing, name)
    }

    fn layer(&mut self, id: LayerId) -> Result<Option<Layer>, StoreError> {
        self.inner.layer(id)
    }

    fn insert_layer(&mut self, layer: &Layer) -> Result<LayerId, StoreError> {
        self.inner.insert_layer(layer)
    }

    fn layers(&mut self, drawing: DrawingId) -> Result<Vec<(LayerId, Layer)>, StoreError> {
        self.inner.layers(drawing)
    }

    fn find_standard(
        &mut self,
        category: StandardCategory,
        name: &str,
    ) -> Result<Option<(StandardId, StandardEntry)>, StoreError> {
        self.inner.find_standard(category, name)
    }

    fn standard(&mut self, id: StandardId) -> Result<Option<StandardEntry>, StoreError> {
        self.inner.standard(id)
    }

    fn insert_standard(&mut self, entry: &StandardEntry) -> Result<StandardId, StoreError> {
        if self.rival.is_none() {
            let mut other = self.store.begin()?;
            let id = other.insert_standard(entry)?;
            other.commit()?;
            self.rival = Some(id);
        }
        self.inner.insert_standard(entry)
    }

    fn add_standard_usage(&mut self, id: StandardId, delta: u64) -> Result<(), StoreError> {
        self.inner.add_standard_usage(id, delta)
    }

    fn standards(
        &mut self,
        category: StandardCategory,
    ) -> Result<Vec<(StandardId, StandardEntry)>, StoreError> {
        self.inner.standards(category)
    }

    fn insert_primitive(&mut self, primitive: &PrimitiveEntity) -> Result<PrimitiveId, StoreError> {
        self.inner.insert_primitive(primitive)
    }

    fn primitives(
        &mut self,
        drawing: DrawingId,
    ) -> Result<Vec<(PrimitiveId, PrimitiveEntity)>, StoreError> {
        self.inner.primitives(drawing)
    }

    fn insert_text(&mut self, text: &TextAnnotation) -> Result<TextId, StoreError> {
        self.inner.insert_text(text)
    }

    fn texts(&mut self, drawing: DrawingId) -> Result<Vec<(TextId, TextAnnotation)>, StoreError> {
        self.inner.texts(drawing)
    }

    fn insert_dimension(
        &mut self,
        dimension: &DimensionAnnotation,
    ) -> Result<DimensionId, StoreError> {
        self.inner.insert_dimension(dimension)
    }

    fn dimensions(
        &mut self,
        drawing: DrawingId,
    ) -> Result<Vec<(DimensionId, DimensionAnnotation)>, StoreError> {
        self.inner.dimensions(drawing)
    }

    fn insert_hatch(&mut self, hatch: &HatchInstance) -> Result<HatchId, StoreError> {
        self.inner.insert_hatch(hatch)
    }

    fn hatches(&mut self, drawing: DrawingId) -> Result<Vec<(HatchId, HatchInstance)>, StoreError> {
        self.inner.hatches(drawing)
    }

    fn insert_placement(
        &mut self,
        placement: &SymbolPlacement,
    ) -> Result<PlacementId, StoreError> {
        self.inner.insert_placement(placement)
    }

    fn placements(
        &mut self,
        drawing: DrawingId,
    ) -> Result<Vec<(PlacementId, SymbolPlacement)>, StoreError> {
        self.inner.placements(drawing)
    }

    fn insert_viewport(&mut self, viewport: &LayoutViewport) -> Result<ViewportId, StoreError> {
        self.inner.insert_viewport(viewport)
    }

    fn viewports(
        &mut self,
        drawing: DrawingId,
    ) -> Result<Vec<(ViewportId, LayoutViewport)>, StoreError> {
        self.inner.viewports(drawing)
    }

    fn counts(&mut self, drawing: DrawingId) -> Result<DrawingCounts, StoreError> {
        self.inner.counts(drawing)
    }

    fn insert_job(&mut self, job: &ExportJob) -> Result<JobId, StoreError> {
        self.inner.insert_job(job)
    }

    fn job(&mut self, id: JobId) -> Result<Option<ExportJob>, StoreError> {
        self.inner.job(id)
    }

    fn update_job(&mut self, id: JobId, job: &ExportJob) -> Result<(), StoreError> {
        self.inner.update_job(id, job)
    }

    fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.inner.commit()
    }

    fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.inner.rollback()
    }
}

#[test]
fn concurrent_creation_is_resolved_by_rereading() {
    let store = MemoryStore::new();
    let mut racing = Racing::begin(&store);
    let mut resolver = NameResolver::new();

    let id = resolver
        .resolve_standard(
            &mut racing,
            StandardCategory::Layer,
            "C-STORM",
            Some(StandardAttributes::Layer {
                color: Color::RED,
                line_style: None,
                line_weight: Default::default(),
            }),
        )
        .expect("冲突后应当重读成功");
    assert_eq!(Some(id), racing.rival);
    assert_eq!(resolver.stats().conflicts, 1);
    assert_eq!(resolver.stats().created, 0);

    // 同一次运行内再次解析走缓存
    let again = resolver
        .resolve_standard(&mut racing, StandardCategory::Layer, "C-STORM", None)
        .expect("缓存命中");
    assert_eq!(again, id);
    assert_eq!(resolver.stats().cache_hits, 1);
    assert_eq!(resolver.pending_usage(id), 2);

    resolver.flush_usage(&mut racing).expect("写回使用次数失败");
    Box::new(racing).commit().expect("提交失败");

    let mut tx = store.begin().expect("开启事务失败");
    let layers = tx
        .standards(StandardCategory::Layer)
        .expect("读取标准库失败");
    assert_eq!(layers.len(), 1);
    assert_eq!(layers[0].0, id);
    assert_eq!(layers[0].1.usage_count, 2);
}

#[test]
fn concurrent_layer_creation_links_to_the_winner() {
    let store = MemoryStore::new();
    let drawing = {
        let mut tx = store.begin().expect("开启事务失败");
        let id = tx
            .insert_drawing(&Drawing::new("site"))
            .expect("创建图纸失败");
        tx.commit().expect("提交失败");
        id
    };

    let mut racing = Racing::begin(&store);
    let mut resolver = NameResolver::new();
    let (layer, standard) = resolver
        .resolve_layer(&mut racing, drawing, "C-STORM", None)
        .expect("解析图层失败");
    assert_eq!(standard, racing.rival);
    resolver.flush_usage(&mut racing).expect("写回使用次数失败");
    Box::new(racing).commit().expect("提交失败");

    let mut tx = store.begin().expect("开启事务失败");
    let stored = tx.layer(layer).expect("读取图层失败").expect("图层应当存在");
    assert_eq!(stored.standard, standard);
    assert_eq!(
        tx.standards(StandardCategory::Layer)
            .expect("读取标准库失败")
            .len(),
        1
    );
}

#[test]
fn interleaved_runs_merge_into_the_first_committed_standard() {
    let store = MemoryStore::new();
    let (north, south) = {
        let mut tx = store.begin().expect("开启事务失败");
        let north = tx
            .insert_drawing(&Drawing::new("north"))
            .expect("创建图纸失败");
        let south = tx
            .insert_drawing(&Drawing::new("south"))
            .expect("创建图纸失败");
        tx.commit().expect("提交失败");
        (north, south)
    };

    // 两个运行都在对方提交前新建同名标准
    let mut first = store.begin().expect("开启事务失败");
    let mut second = store.begin().expect("开启事务失败");
    let mut first_resolver = NameResolver::new();
    let mut second_resolver = NameResolver::new();
    let (first_layer, first_standard) = first_resolver
        .resolve_layer(first.as_mut(), north, "C-STORM", None)
        .expect("解析图层失败");
    let (second_layer, second_standard) = second_resolver
        .resolve_layer(second.as_mut(), south, "C-STORM", None)
        .expect("解析图层失败");
    assert_eq!(first_resolver.stats().created, 2);
    assert_eq!(second_resolver.stats().created, 2);
    assert_ne!(first_standard, second_standard);

    first_resolver
        .flush_usage(first.as_mut())
        .expect("写回使用次数失败");
    second_resolver
        .flush_usage(second.as_mut())
        .expect("写回使用次数失败");
    first.commit().expect("先提交的运行应当成功");
    second.commit().expect("后提交的运行应当并入已有标准");

    let mut tx = store.begin().expect("开启事务失败");
    let standards = tx
        .standards(StandardCategory::Layer)
        .expect("读取标准库失败");
    assert_eq!(standards.len(), 1);
    assert_eq!(Some(standards[0].0), first_standard);
    assert_eq!(standards[0].1.usage_count, 2);

    let north_layer = tx.layer(first_layer).expect("读取图层失败").expect("图层应当存在");
    let south_layer = tx
        .layer(second_layer)
        .expect("读取图层失败")
        .expect("图层应当存在");
    assert_eq!(north_layer.standard, first_standard);
    assert_eq!(south_layer.standard, first_standard);
}
