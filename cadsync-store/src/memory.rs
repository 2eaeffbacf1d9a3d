use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use cadsync_core::model::{
    DimensionAnnotation, DimensionId, Drawing, DrawingCounts, DrawingId, ExportJob, HatchId,
    HatchInstance, JobId, Layer, LayerId, LayoutViewport, PlacementId, PrimitiveEntity,
    PrimitiveId, StandardCategory, StandardEntry, StandardId, SymbolPlacement, TextAnnotation,
    TextId, ViewportId,
};
use tracing::{debug, warn};

use crate::{Store, StoreError, Transaction, check_job_update, check_layer_owner};

/// 进程内存储，主要用于测试与一次性转换。
///
/// 每个事务在开启时复制一份已提交状态作为工作副本，并记录写操作；
/// 提交时把操作重放到最新的已提交状态上，任何约束失败都使整个事务作废。
/// 标准库查询在工作副本未命中时回落到已提交状态，以支持冲突后的重读。
/// 提交时若同名标准已由并发事务先行提交，本事务的新建条目并入已提交条目，
/// 后续引用与使用计数随之改指。
#[derive(Debug, Default)]
pub struct MemoryStore {
    live: Mutex<State>,
    next_id: AtomicU64,
    write_budget: Mutex<Option<usize>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 故障注入：之后的写操作只允许成功 `writes` 次，再往后一律返回
    /// [`StoreError::Backend`]。预算跨事务共享。
    pub fn with_write_budget(mut self, writes: usize) -> Self {
        self.write_budget = Mutex::new(Some(writes));
        self
    }

    /// 解除故障注入。
    pub fn clear_write_budget(&self) {
        if let Ok(mut budget) = self.write_budget.lock() {
            *budget = None;
        }
    }

    fn lock_live(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        self.live
            .lock()
            .map_err(|_| StoreError::Backend("memory store mutex poisoned".to_string()))
    }

    fn allocate(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn charge_write(&self) -> Result<(), StoreError> {
        let mut budget = self
            .write_budget
            .lock()
            .map_err(|_| StoreError::Backend("memory store mutex poisoned".to_string()))?;
        match budget.as_mut() {
            None => Ok(()),
            Some(0) => {
                warn!("内存存储触发注入的写入故障");
                Err(StoreError::Backend("injected write failure".to_string()))
            }
            Some(remaining) => {
                *remaining -= 1;
                Ok(())
            }
        }
    }
}

impl Store for MemoryStore {
    fn begin(&self) -> Result<Box<dyn Transaction + '_>, StoreError> {
        let working = self.lock_live()?.clone();
        Ok(Box::new(MemoryTransaction {
            store: self,
            working,
            ops: Vec::new(),
        }))
    }
}

#[derive(Debug, Clone, Default)]
struct State {
    drawings: BTreeMap<DrawingId, Drawing>,
    layers: BTreeMap<LayerId, Layer>,
    standards: BTreeMap<StandardId, StandardEntry>,
    primitives: BTreeMap<PrimitiveId, PrimitiveEntity>,
    texts: BTreeMap<TextId, TextAnnotation>,
    dimensions: BTreeMap<DimensionId, DimensionAnnotation>,
    hatches: BTreeMap<HatchId, HatchInstance>,
    placements: BTreeMap<PlacementId, SymbolPlacement>,
    viewports: BTreeMap<ViewportId, LayoutViewport>,
    jobs: BTreeMap<JobId, ExportJob>,
}

#[derive(Debug, Clone)]
enum Op {
    InsertDrawing(DrawingId, Drawing),
    UpdateDrawing(DrawingId, Drawing),
    DeleteDrawing(DrawingId),
    InsertLayer(LayerId, Layer),
    InsertStandard(StandardId, StandardEntry),
    AddUsage(StandardId, u64),
    InsertPrimitive(PrimitiveId, PrimitiveEntity),
    InsertText(TextId, TextAnnotation),
    InsertDimension(DimensionId, DimensionAnnotation),
    InsertHatch(HatchId, HatchInstance),
    InsertPlacement(PlacementId, SymbolPlacement),
    InsertViewport(ViewportId, LayoutViewport),
    InsertJob(JobId, ExportJob),
    UpdateJob(JobId, ExportJob),
}

impl Op {
    /// 把对 `from` 的标准引用改指 `to`。
    fn remap_standard(&mut self, from: StandardId, to: StandardId) {
        let swap = |slot: &mut StandardId| {
            if *slot == from {
                *slot = to;
            }
        };
        let swap_optional = |slot: &mut Option<StandardId>| {
            if *slot == Some(from) {
                *slot = Some(to);
            }
        };
        match self {
            Op::InsertLayer(_, layer) => {
                swap_optional(&mut layer.standard);
                swap_optional(&mut layer.line_style);
            }
            Op::AddUsage(id, _) => swap(id),
            Op::InsertPrimitive(_, primitive) => swap_optional(&mut primitive.style.line_style),
            Op::InsertText(_, text) => swap_optional(&mut text.style),
            Op::InsertDimension(_, dimension) => swap(&mut dimension.style),
            Op::InsertHatch(_, hatch) => swap(&mut hatch.pattern),
            Op::InsertPlacement(_, placement) => swap_optional(&mut placement.symbol),
            _ => {}
        }
    }
}

fn require_drawing(state: &State, id: DrawingId) -> Result<(), StoreError> {
    if state.drawings.contains_key(&id) {
        Ok(())
    } else {
        Err(StoreError::NotFound {
            kind: "drawing",
            id: id.get(),
        })
    }
}

impl State {
    fn find_layer(&self, drawing: DrawingId, name: &str) -> Option<(LayerId, &Layer)> {
        self.layers
            .iter()
            .find(|(_, layer)| layer.drawing_id == drawing && layer.name == name)
            .map(|(id, layer)| (*id, layer))
    }

    fn find_standard(
        &self,
        category: StandardCategory,
        name: &str,
    ) -> Option<(StandardId, &StandardEntry)> {
        self.standards
            .iter()
            .find(|(_, entry)| entry.category() == category && entry.name == name)
            .map(|(id, entry)| (*id, entry))
    }

    fn apply(&mut self, op: &Op) -> Result<(), StoreError> {
        match op {
            Op::InsertDrawing(id, drawing) => {
                self.drawings.insert(*id, drawing.clone());
            }
            Op::UpdateDrawing(id, drawing) => {
                let slot = self.drawings.get_mut(id).ok_or(StoreError::NotFound {
                    kind: "drawing",
                    id: id.get(),
                })?;
                *slot = drawing.clone();
            }
            Op::DeleteDrawing(id) => self.delete_drawing(*id),
            Op::InsertLayer(id, layer) => {
                require_drawing(self, layer.drawing_id)?;
                if self.find_layer(layer.drawing_id, &layer.name).is_some() {
                    return Err(StoreError::UniqueViolation {
                        table: "layers",
                        key: format!("({}, {})", layer.drawing_id, layer.name),
                    });
                }
                self.layers.insert(*id, layer.clone());
            }
            Op::InsertStandard(id, entry) => {
                if self.find_standard(entry.category(), &entry.name).is_some() {
                    return Err(StoreError::UniqueViolation {
                        table: "standards",
                        key: format!("({}, {})", entry.category(), entry.name),
                    });
                }
                self.standards.insert(*id, entry.clone());
            }
            Op::AddUsage(id, delta) => {
                let entry = self.standards.get_mut(id).ok_or(StoreError::NotFound {
                    kind: "standard",
                    id: id.get(),
                })?;
                entry.usage_count += delta;
            }
            Op::InsertPrimitive(id, primitive) => {
                self.check_child("primitive", primitive.drawing_id, Some(primitive.layer_id))?;
                self.primitives.insert(*id, primitive.clone());
            }
            Op::InsertText(id, text) => {
                self.check_child("text", text.drawing_id, Some(text.layer_id))?;
                self.texts.insert(*id, text.clone());
            }
            Op::InsertDimension(id, dimension) => {
                self.check_child("dimension", dimension.drawing_id, Some(dimension.layer_id))?;
                self.dimensions.insert(*id, dimension.clone());
            }
            Op::InsertHatch(id, hatch) => {
                self.check_child("hatch", hatch.drawing_id, Some(hatch.layer_id))?;
                self.hatches.insert(*id, hatch.clone());
            }
            Op::InsertPlacement(id, placement) => {
                self.check_child("placement", placement.drawing_id, placement.layer_id)?;
                self.placements.insert(*id, placement.clone());
            }
            Op::InsertViewport(id, viewport) => {
                self.check_child("viewport", viewport.drawing_id, None)?;
                self.viewports.insert(*id, viewport.clone());
            }
            Op::InsertJob(id, job) => {
                self.jobs.insert(*id, job.clone());
            }
            Op::UpdateJob(id, job) => {
                let current = self.jobs.get(id).ok_or(StoreError::NotFound {
                    kind: "export job",
                    id: id.get(),
                })?;
                check_job_update(current, job)?;
                self.jobs.insert(*id, job.clone());
            }
        }
        Ok(())
    }

    fn check_child(
        &self,
        kind: &'static str,
        drawing: DrawingId,
        layer: Option<LayerId>,
    ) -> Result<(), StoreError> {
        require_drawing(self, drawing)?;
        match layer {
            Some(layer_id) => check_layer_owner(kind, drawing, layer_id, self.layers.get(&layer_id)),
            None => Ok(()),
        }
    }

    fn delete_drawing(&mut self, id: DrawingId) {
        self.drawings.remove(&id);
        self.layers.retain(|_, layer| layer.drawing_id != id);
        self.primitives.retain(|_, record| record.drawing_id != id);
        self.texts.retain(|_, record| record.drawing_id != id);
        self.dimensions.retain(|_, record| record.drawing_id != id);
        self.hatches.retain(|_, record| record.drawing_id != id);
        self.placements.retain(|_, record| record.drawing_id != id);
        self.viewports.retain(|_, record| record.drawing_id != id);
    }

    fn counts(&self, drawing: DrawingId) -> DrawingCounts {
        DrawingCounts {
            layers: self.layers.values().filter(|r| r.drawing_id == drawing).count(),
            primitives: self.primitives.values().filter(|r| r.drawing_id == drawing).count(),
            text: self.texts.values().filter(|r| r.drawing_id == drawing).count(),
            dimensions: self.dimensions.values().filter(|r| r.drawing_id == drawing).count(),
            hatches: self.hatches.values().filter(|r| r.drawing_id == drawing).count(),
            placements: self.placements.values().filter(|r| r.drawing_id == drawing).count(),
            viewports: self.viewports.values().filter(|r| r.drawing_id == drawing).count(),
        }
    }
}

fn owned_by<K: Copy, V: Clone>(
    map: &BTreeMap<K, V>,
    drawing: DrawingId,
    owner: impl Fn(&V) -> DrawingId,
) -> Vec<(K, V)> {
    map.iter()
        .filter(|(_, record)| owner(record) == drawing)
        .map(|(id, record)| (*id, record.clone()))
        .collect()
}

struct MemoryTransaction<'a> {
    store: &'a MemoryStore,
    working: State,
    ops: Vec<Op>,
}

impl MemoryTransaction<'_> {
    /// 先在工作副本上校验并应用，成功后才记入操作日志。
    fn write(&mut self, op: Op) -> Result<(), StoreError> {
        self.store.charge_write()?;
        self.working.apply(&op)?;
        self.ops.push(op);
        Ok(())
    }
}

impl Transaction for MemoryTransaction<'_> {
    fn insert_drawing(&mut self, drawing: &Drawing) -> Result<DrawingId, StoreError> {
        let id = DrawingId::new(self.store.allocate());
        self.write(Op::InsertDrawing(id, drawing.clone()))?;
        Ok(id)
    }

    fn drawing(&mut self, id: DrawingId) -> Result<Option<Drawing>, StoreError> {
        Ok(self.working.drawings.get(&id).cloned())
    }

    fn update_drawing(&mut self, id: DrawingId, drawing: &Drawing) -> Result<(), StoreError> {
        self.write(Op::UpdateDrawing(id, drawing.clone()))
    }

    fn delete_drawing(&mut self, id: DrawingId) -> Result<bool, StoreError> {
        if !self.working.drawings.contains_key(&id) {
            return Ok(false);
        }
        self.write(Op::DeleteDrawing(id))?;
        Ok(true)
    }

    fn drawings(&mut self) -> Result<Vec<(DrawingId, Drawing)>, StoreError> {
        Ok(self
            .working
            .drawings
            .iter()
            .map(|(id, drawing)| (*id, drawing.clone()))
            .collect())
    }

    fn find_layer(
        &mut self,
        drawing: DrawingId,
        name: &str,
    ) -> Result<Option<(LayerId, Layer)>, StoreError> {
        Ok(self
            .working
            .find_layer(drawing, name)
            .map(|(id, layer)| (id, layer.clone())))
    }

    fn layer(&mut self, id: LayerId) -> Result<Option<Layer>, StoreError> {
        Ok(self.working.layers.get(&id).cloned())
    }

    fn insert_layer(&mut self, layer: &Layer) -> Result<LayerId, StoreError> {
        let id = LayerId::new(self.store.allocate());
        self.write(Op::InsertLayer(id, layer.clone()))?;
        Ok(id)
    }

    fn layers(&mut self, drawing: DrawingId) -> Result<Vec<(LayerId, Layer)>, StoreError> {
        Ok(owned_by(&self.working.layers, drawing, |r| r.drawing_id))
    }

    fn find_standard(
        &mut self,
        category: StandardCategory,
        name: &str,
    ) -> Result<Option<(StandardId, StandardEntry)>, StoreError> {
        if let Some((id, entry)) = self.working.find_standard(category, name) {
            return Ok(Some((id, entry.clone())));
        }
        let live = self.store.lock_live()?;
        Ok(live
            .find_standard(category, name)
            .map(|(id, entry)| (id, entry.clone())))
    }

    fn standard(&mut self, id: StandardId) -> Result<Option<StandardEntry>, StoreError> {
        if let Some(entry) = self.working.standards.get(&id) {
            return Ok(Some(entry.clone()));
        }
        Ok(self.store.lock_live()?.standards.get(&id).cloned())
    }

    fn insert_standard(&mut self, entry: &StandardEntry) -> Result<StandardId, StoreError> {
        // 其他事务已提交的同名条目同样构成冲突
        if self
            .store
            .lock_live()?
            .find_standard(entry.category(), &entry.name)
            .is_some()
        {
            debug!(category = %entry.category(), name = %entry.name, "标准库条目已由其他事务提交");
            return Err(StoreError::UniqueViolation {
                table: "standards",
                key: format!("({}, {})", entry.category(), entry.name),
            });
        }
        let id = StandardId::new(self.store.allocate());
        self.write(Op::InsertStandard(id, entry.clone()))?;
        Ok(id)
    }

    fn add_standard_usage(&mut self, id: StandardId, delta: u64) -> Result<(), StoreError> {
        self.store.charge_write()?;
        if let Some(entry) = self.working.standards.get_mut(&id) {
            entry.usage_count += delta;
        } else if !self.store.lock_live()?.standards.contains_key(&id) {
            return Err(StoreError::NotFound {
                kind: "standard",
                id: id.get(),
            });
        }
        self.ops.push(Op::AddUsage(id, delta));
        Ok(())
    }

    fn standards(
        &mut self,
        category: StandardCategory,
    ) -> Result<Vec<(StandardId, StandardEntry)>, StoreError> {
        let mut entries: Vec<(StandardId, StandardEntry)> = self
            .working
            .standards
            .iter()
            .filter(|(_, entry)| entry.category() == category)
            .map(|(id, entry)| (*id, entry.clone()))
            .collect();
        entries.sort_by(|(_, a), (_, b)| {
            b.usage_count
                .cmp(&a.usage_count)
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(entries)
    }

    fn insert_primitive(&mut self, primitive: &PrimitiveEntity) -> Result<PrimitiveId, StoreError> {
        let id = PrimitiveId::new(self.store.allocate());
        self.write(Op::InsertPrimitive(id, primitive.clone()))?;
        Ok(id)
    }

    fn primitives(
        &mut self,
        drawing: DrawingId,
    ) -> Result<Vec<(PrimitiveId, PrimitiveEntity)>, StoreError> {
        Ok(owned_by(&self.working.primitives, drawing, |r| r.drawing_id))
    }

    fn insert_text(&mut self, text: &TextAnnotation) -> Result<TextId, StoreError> {
        let id = TextId::new(self.store.allocate());
        self.write(Op::InsertText(id, text.clone()))?;
        Ok(id)
    }

    fn texts(&mut self, drawing: DrawingId) -> Result<Vec<(TextId, TextAnnotation)>, StoreError> {
        Ok(owned_by(&self.working.texts, drawing, |r| r.drawing_id))
    }

    fn insert_dimension(
        &mut self,
        dimension: &DimensionAnnotation,
    ) -> Result<DimensionId, StoreError> {
        let id = DimensionId::new(self.store.allocate());
        self.write(Op::InsertDimension(id, dimension.clone()))?;
        Ok(id)
    }

    fn dimensions(
        &mut self,
        drawing: DrawingId,
    ) -> Result<Vec<(DimensionId, DimensionAnnotation)>, StoreError> {
        Ok(owned_by(&self.working.dimensions, drawing, |r| r.drawing_id))
    }

    fn insert_hatch(&mut self, hatch: &HatchInstance) -> Result<HatchId, StoreError> {
        let id = HatchId::new(self.store.allocate());
        self.write(Op::InsertHatch(id, hatch.clone()))?;
        Ok(id)
    }

    fn hatches(&mut self, drawing: DrawingId) -> Result<Vec<(HatchId, HatchInstance)>, StoreError> {
        Ok(owned_by(&self.working.hatches, drawing, |r| r.drawing_id))
    }

    fn insert_placement(
        &mut self,
        placement: &SymbolPlacement,
    ) -> Result<PlacementId, StoreError> {
        let id = PlacementId::new(self.store.allocate());
        self.write(Op::InsertPlacement(id, placement.clone()))?;
        Ok(id)
    }

    fn placements(
        &mut self,
        drawing: DrawingId,
    ) -> Result<Vec<(PlacementId, SymbolPlacement)>, StoreError> {
        Ok(owned_by(&self.working.placements, drawing, |r| r.drawing_id))
    }

    fn insert_viewport(&mut self, viewport: &LayoutViewport) -> Result<ViewportId, StoreError> {
        let id = ViewportId::new(self.store.allocate());
        self.write(Op::InsertViewport(id, viewport.clone()))?;
        Ok(id)
    }

    fn viewports(
        &mut self,
        drawing: DrawingId,
    ) -> Result<Vec<(ViewportId, LayoutViewport)>, StoreError> {
        Ok(owned_by(&self.working.viewports, drawing, |r| r.drawing_id))
    }

    fn counts(&mut self, drawing: DrawingId) -> Result<DrawingCounts, StoreError> {
        Ok(self.working.counts(drawing))
    }

    fn insert_job(&mut self, job: &ExportJob) -> Result<JobId, StoreError> {
        let id = JobId::new(self.store.allocate());
        self.write(Op::InsertJob(id, job.clone()))?;
        Ok(id)
    }

    fn job(&mut self, id: JobId) -> Result<Option<ExportJob>, StoreError> {
        if let Some(job) = self.working.jobs.get(&id) {
            return Ok(Some(job.clone()));
        }
        // 任务状态由其他事务推进，读取时以已提交状态为准
        Ok(self.store.lock_live()?.jobs.get(&id).cloned())
    }

    fn update_job(&mut self, id: JobId, job: &ExportJob) -> Result<(), StoreError> {
        if !self.working.jobs.contains_key(&id) {
            if let Some(current) = self.store.lock_live()?.jobs.get(&id).cloned() {
                self.working.jobs.insert(id, current);
            }
        }
        self.write(Op::UpdateJob(id, job.clone()))
    }

    fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let MemoryTransaction { store, mut ops, .. } = *self;
        if ops.is_empty() {
            return Ok(());
        }
        let mut live = store.lock_live()?;
        let mut next = live.clone();
        for index in 0..ops.len() {
            let merged = match &ops[index] {
                Op::InsertStandard(id, entry) => next
                    .find_standard(entry.category(), &entry.name)
                    .map(|(winner, _)| (*id, winner)),
                _ => None,
            };
            if let Some((ours, winner)) = merged {
                debug!(ours = %ours, winner = %winner, "标准库条目已由并发事务提交，改用已提交条目");
                for later in &mut ops[index + 1..] {
                    later.remap_standard(ours, winner);
                }
                continue;
            }
            next.apply(&ops[index])?;
        }
        *live = next;
        debug!(operations = ops.len(), "内存事务已提交");
        Ok(())
    }

    fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        debug!(operations = self.ops.len(), "内存事务已回滚");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadsync_core::model::StandardAttributes;

    fn layer_standard(name: &str) -> StandardEntry {
        StandardEntry::new(
            name,
            StandardAttributes::default_for(StandardCategory::Layer),
        )
    }

    #[test]
    fn uncommitted_writes_are_invisible() {
        let store = MemoryStore::new();
        let mut tx = store.begin().expect("开启事务");
        let id = tx.insert_drawing(&Drawing::new("A")).expect("插入图纸");
        assert!(tx.drawing(id).expect("读取").is_some());

        let mut other = store.begin().expect("开启事务");
        assert!(other.drawing(id).expect("读取").is_none());
        drop(other);

        tx.rollback().expect("回滚");
        let mut after = store.begin().expect("开启事务");
        assert!(after.drawings().expect("列表").is_empty());
    }

    #[test]
    fn conflicting_standard_is_visible_after_conflict() {
        let store = MemoryStore::new();
        let mut slow = store.begin().expect("开启事务");
        assert!(
            slow.find_standard(StandardCategory::Layer, "C-STORM")
                .expect("查找")
                .is_none()
        );

        let mut fast = store.begin().expect("开启事务");
        let winner = fast
            .insert_standard(&layer_standard("C-STORM"))
            .expect("插入标准");
        fast.commit().expect("提交");

        let err = slow
            .insert_standard(&layer_standard("C-STORM"))
            .expect_err("应当冲突");
        assert!(err.is_unique_violation());
        let (found, _) = slow
            .find_standard(StandardCategory::Layer, "C-STORM")
            .expect("重读")
            .expect("冲突后应能读到");
        assert_eq!(found, winner);
        slow.add_standard_usage(found, 1).expect("计数");
        slow.commit().expect("提交");

        let mut check = store.begin().expect("开启事务");
        let entry = check.standard(winner).expect("读取").expect("存在");
        assert_eq!(entry.usage_count, 1);
    }

    #[test]
    fn late_commit_merges_into_committed_standard() {
        let store = MemoryStore::new();
        let mut first = store.begin().expect("开启事务");
        let mut second = store.begin().expect("开启事务");
        let winner = first
            .insert_standard(&layer_standard("C-STORM"))
            .expect("插入标准");
        let loser = second
            .insert_standard(&layer_standard("C-STORM"))
            .expect("提交前互不可见");
        first.add_standard_usage(winner, 1).expect("计数");
        second.add_standard_usage(loser, 2).expect("计数");
        first.commit().expect("提交");
        second.commit().expect("后提交者并入已有条目");

        let mut check = store.begin().expect("开启事务");
        let standards = check.standards(StandardCategory::Layer).expect("列表");
        assert_eq!(standards.len(), 1);
        assert_eq!(standards[0].0, winner);
        assert_eq!(standards[0].1.usage_count, 3);
        assert!(check.standard(loser).expect("读取").is_none());
    }

    #[test]
    fn write_budget_fails_later_writes() {
        let store = MemoryStore::new().with_write_budget(1);
        let mut tx = store.begin().expect("开启事务");
        tx.insert_drawing(&Drawing::new("A")).expect("第一次写入");
        let err = tx.insert_drawing(&Drawing::new("B")).expect_err("预算耗尽");
        assert!(matches!(err, StoreError::Backend(_)));
        store.clear_write_budget();
        tx.insert_drawing(&Drawing::new("C")).expect("解除后可写");
    }
}
