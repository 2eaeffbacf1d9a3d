//! 名称解析与缓存。
//!
//! 自由文本名称（图层、线型、文字样式、填充图案、标注样式、符号）解析为稳定标识，
//! 缺失时按"查找或创建"在标准库中登记。并发创建依靠存储层的唯一约束：
//! 插入冲突后重新读取对方已提交的条目，不使用应用层锁。
//!
//! 每次导入使用一个独立实例，结束时（无论成败）调用 [`NameResolver::clear`]。

use std::collections::{BTreeMap, HashMap};

use cadsync_core::model::{
    DrawingId, Layer, LayerId, StandardAttributes, StandardCategory, StandardEntry, StandardId,
    SymbolDefinition,
};
use cadsync_core::style::{Color, LineWeight};
use cadsync_store::{StoreError, Transaction};
use tracing::debug;

/// 源文件图层表提供的样式提示。
#[derive(Debug, Clone, PartialEq)]
pub struct LayerHints {
    pub color: Color,
    pub line_style: Option<String>,
    pub line_weight: LineWeight,
    pub frozen: bool,
    pub locked: bool,
    pub handle: Option<String>,
}

impl Default for LayerHints {
    fn default() -> Self {
        Self {
            color: Color::WHITE,
            line_style: None,
            line_weight: LineWeight::Standard,
            frozen: false,
            locked: false,
            handle: None,
        }
    }
}

impl LayerHints {
    fn standard_attributes(&self) -> StandardAttributes {
        StandardAttributes::Layer {
            color: self.color,
            line_style: self.line_style.clone(),
            line_weight: self.line_weight,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolverStats {
    /// 命中运行内缓存的次数。
    pub cache_hits: usize,
    /// 访问存储的查找次数。
    pub lookups: usize,
    /// 新建的标准库条目与图层数。
    pub created: usize,
    /// 插入冲突后重读的次数。
    pub conflicts: usize,
}

#[derive(Debug, Default)]
pub struct NameResolver {
    layers: HashMap<(DrawingId, String), (LayerId, Option<StandardId>)>,
    standards: HashMap<(StandardCategory, String), StandardId>,
    /// 符号查找结果，未命中也缓存。
    symbols: HashMap<String, Option<StandardId>>,
    pending_usage: BTreeMap<StandardId, u64>,
    stats: ResolverStats,
}

impl NameResolver {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn stats(&self) -> ResolverStats {
        self.stats
    }

    /// 尚未写回存储的使用次数。
    pub fn pending_usage(&self, id: StandardId) -> u64 {
        self.pending_usage.get(&id).copied().unwrap_or(0)
    }

    /// 清空缓存、待写计数与统计。
    pub fn clear(&mut self) {
        self.layers.clear();
        self.standards.clear();
        self.symbols.clear();
        self.pending_usage.clear();
        self.stats = ResolverStats::default();
    }

    /// 所有类别共用的查找或创建。`hint` 的类别与 `category` 不一致时改用缺省属性。
    pub fn resolve_standard(
        &mut self,
        tx: &mut dyn Transaction,
        category: StandardCategory,
        name: &str,
        hint: Option<StandardAttributes>,
    ) -> Result<StandardId, StoreError> {
        let key = (category, name.to_string());
        if let Some(id) = self.standards.get(&key).copied() {
            self.stats.cache_hits += 1;
            self.touch(id);
            return Ok(id);
        }
        self.stats.lookups += 1;
        let id = match tx.find_standard(category, name)? {
            Some((id, _)) => id,
            None => {
                let attributes = hint
                    .filter(|attributes| attributes.category() == category)
                    .unwrap_or_else(|| StandardAttributes::default_for(category));
                match tx.insert_standard(&StandardEntry::new(name, attributes)) {
                    Ok(id) => {
                        self.stats.created += 1;
                        debug!(%category, name, id = %id, "新建标准库条目");
                        id
                    }
                    Err(err) if err.is_unique_violation() => {
                        self.stats.conflicts += 1;
                        debug!(%category, name, error = %err, "标准库条目已被并发创建，重新读取");
                        tx.find_standard(category, name)?
                            .map(|(id, _)| id)
                            .ok_or_else(|| {
                                StoreError::Integrity(format!(
                                    "{category} {name} missing after unique violation"
                                ))
                            })?
                    }
                    Err(err) => return Err(err),
                }
            }
        };
        debug!(%category, name, id = %id, "名称已解析");
        self.standards.insert(key, id);
        self.touch(id);
        Ok(id)
    }

    /// 解析图纸内的图层，返回图层标识与关联的图层标准。
    ///
    /// 顺序：运行内缓存 → 图纸已有图层 → 已有图层标准（据此新建图层）→
    /// 新建图层标准与图层。`hints` 为空时新图层沿用标准的属性。
    pub fn resolve_layer(
        &mut self,
        tx: &mut dyn Transaction,
        drawing: DrawingId,
        name: &str,
        hints: Option<&LayerHints>,
    ) -> Result<(LayerId, Option<StandardId>), StoreError> {
        let key = (drawing, name.to_string());
        if let Some((layer, standard)) = self.layers.get(&key).copied() {
            self.stats.cache_hits += 1;
            if let Some(standard) = standard {
                self.touch(standard);
            }
            return Ok((layer, standard));
        }
        self.stats.lookups += 1;
        if let Some((layer, existing)) = tx.find_layer(drawing, name)? {
            return Ok(self.remember_layer(key, layer, existing.standard));
        }

        let hint = hints.map(LayerHints::standard_attributes);
        let standard = self.resolve_standard(tx, StandardCategory::Layer, name, hint)?;
        let inherited;
        let hints = match hints {
            Some(hints) => hints,
            None => {
                inherited = self.hints_from_standard(tx, standard)?;
                &inherited
            }
        };
        let line_style = match hints.line_style.as_deref() {
            Some(line_style) => Some(self.resolve_line_style(tx, line_style, None)?),
            None => None,
        };
        let layer = Layer {
            drawing_id: drawing,
            name: name.to_string(),
            color: hints.color,
            line_style,
            line_weight: hints.line_weight,
            frozen: hints.frozen,
            locked: hints.locked,
            standard: Some(standard),
            handle: hints.handle.clone(),
        };
        let id = match tx.insert_layer(&layer) {
            Ok(id) => {
                self.stats.created += 1;
                debug!(drawing = %drawing, name, id = %id, standard = %standard, "新建图层");
                id
            }
            Err(err) if err.is_unique_violation() => {
                self.stats.conflicts += 1;
                debug!(drawing = %drawing, name, error = %err, "图层已被并发创建，重新读取");
                let (id, existing) = tx.find_layer(drawing, name)?.ok_or_else(|| {
                    StoreError::Integrity(format!(
                        "layer {name} of drawing {drawing} missing after unique violation"
                    ))
                })?;
                // 标准已在上面计数，这里只登记缓存
                self.layers.insert(key, (id, existing.standard));
                return Ok((id, existing.standard));
            }
            Err(err) => return Err(err),
        };
        self.layers.insert(key, (id, Some(standard)));
        Ok((id, Some(standard)))
    }

    pub fn resolve_line_style(
        &mut self,
        tx: &mut dyn Transaction,
        name: &str,
        hint: Option<StandardAttributes>,
    ) -> Result<StandardId, StoreError> {
        self.resolve_standard(tx, StandardCategory::LineStyle, name, hint)
    }

    pub fn resolve_text_style(
        &mut self,
        tx: &mut dyn Transaction,
        name: &str,
        hint: Option<StandardAttributes>,
    ) -> Result<StandardId, StoreError> {
        self.resolve_standard(tx, StandardCategory::TextStyle, name, hint)
    }

    pub fn resolve_fill_pattern(
        &mut self,
        tx: &mut dyn Transaction,
        name: &str,
        hint: Option<StandardAttributes>,
    ) -> Result<StandardId, StoreError> {
        self.resolve_standard(tx, StandardCategory::FillPattern, name, hint)
    }

    pub fn resolve_dimension_style(
        &mut self,
        tx: &mut dyn Transaction,
        name: &str,
        hint: Option<StandardAttributes>,
    ) -> Result<StandardId, StoreError> {
        self.resolve_standard(tx, StandardCategory::DimensionStyle, name, hint)
    }

    /// 只查不建：符号没有定义时返回 `None`，调用方保留自由文本名称。
    pub fn resolve_symbol(
        &mut self,
        tx: &mut dyn Transaction,
        name: &str,
    ) -> Result<Option<StandardId>, StoreError> {
        let found = match self.symbols.get(name).copied() {
            Some(cached) => {
                self.stats.cache_hits += 1;
                cached
            }
            None => {
                self.stats.lookups += 1;
                let found = tx
                    .find_standard(StandardCategory::Symbol, name)?
                    .map(|(id, _)| id);
                debug!(name, found = found.is_some(), "符号名称已查找");
                self.symbols.insert(name.to_string(), found);
                found
            }
        };
        if let Some(id) = found {
            self.touch(id);
        }
        Ok(found)
    }

    /// 登记块定义：已存在同名符号时沿用已有定义。
    pub fn register_symbol(
        &mut self,
        tx: &mut dyn Transaction,
        name: &str,
        definition: SymbolDefinition,
    ) -> Result<StandardId, StoreError> {
        let id = self.resolve_standard(
            tx,
            StandardCategory::Symbol,
            name,
            Some(StandardAttributes::Symbol(definition)),
        )?;
        self.symbols.insert(name.to_string(), Some(id));
        Ok(id)
    }

    /// 把累积的使用次数写回存储，需在提交前调用。
    pub fn flush_usage(&mut self, tx: &mut dyn Transaction) -> Result<(), StoreError> {
        for (id, delta) in std::mem::take(&mut self.pending_usage) {
            tx.add_standard_usage(id, delta)?;
        }
        Ok(())
    }

    fn remember_layer(
        &mut self,
        key: (DrawingId, String),
        layer: LayerId,
        standard: Option<StandardId>,
    ) -> (LayerId, Option<StandardId>) {
        debug!(drawing = %key.0, name = %key.1, id = %layer, "沿用图纸已有图层");
        if let Some(standard) = standard {
            self.touch(standard);
        }
        self.layers.insert(key, (layer, standard));
        (layer, standard)
    }

    fn hints_from_standard(
        &mut self,
        tx: &mut dyn Transaction,
        standard: StandardId,
    ) -> Result<LayerHints, StoreError> {
        let entry = tx.standard(standard)?;
        Ok(match entry.map(|entry| entry.attributes) {
            Some(StandardAttributes::Layer {
                color,
                line_style,
                line_weight,
            }) => LayerHints {
                color,
                line_style,
                line_weight,
                ..LayerHints::default()
            },
            _ => LayerHints::default(),
        })
    }

    fn touch(&mut self, id: StandardId) {
        *self.pending_usage.entry(id).or_insert(0) += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadsync_core::model::Drawing;
    use cadsync_store::{MemoryStore, Store};

    fn red() -> LayerHints {
        LayerHints {
            color: Color::RED,
            ..LayerHints::default()
        }
    }

    #[test]
    fn cache_hits_still_count_usage() {
        let store = MemoryStore::new();
        let mut tx = store.begin().expect("开启事务");
        let mut resolver = NameResolver::new();
        let first = resolver
            .resolve_fill_pattern(tx.as_mut(), "ANSI31", None)
            .expect("解析");
        let second = resolver
            .resolve_fill_pattern(tx.as_mut(), "ANSI31", None)
            .expect("解析");
        assert_eq!(first, second);
        assert_eq!(resolver.pending_usage(first), 2);
        assert_eq!(resolver.stats().cache_hits, 1);
        assert_eq!(resolver.stats().created, 1);

        resolver.flush_usage(tx.as_mut()).expect("写回");
        assert_eq!(resolver.pending_usage(first), 0);
        let entry = tx.standard(first).expect("读取").expect("存在");
        assert_eq!(entry.usage_count, 2);
    }

    #[test]
    fn new_layer_creates_and_links_a_standard() {
        let store = MemoryStore::new();
        let mut tx = store.begin().expect("开启事务");
        let drawing = tx.insert_drawing(&Drawing::new("A")).expect("插入图纸");
        let mut resolver = NameResolver::new();
        let (layer, standard) = resolver
            .resolve_layer(tx.as_mut(), drawing, "C-STORM", Some(&red()))
            .expect("解析图层");
        let standard = standard.expect("应关联图层标准");
        let stored = tx.layer(layer).expect("读取").expect("存在");
        assert_eq!(stored.standard, Some(standard));
        assert_eq!(stored.color, Color::RED);
        let entry = tx.standard(standard).expect("读取").expect("存在");
        assert_eq!(entry.category(), StandardCategory::Layer);

        let again = resolver
            .resolve_layer(tx.as_mut(), drawing, "C-STORM", None)
            .expect("解析图层");
        assert_eq!(again, (layer, Some(standard)));
        assert_eq!(tx.layers(drawing).expect("列表").len(), 1);
    }

    #[test]
    fn layer_without_hints_inherits_standard_attributes() {
        let store = MemoryStore::new();
        let mut tx = store.begin().expect("开启事务");
        let a = tx.insert_drawing(&Drawing::new("A")).expect("插入图纸");
        let b = tx.insert_drawing(&Drawing::new("B")).expect("插入图纸");
        let mut resolver = NameResolver::new();
        resolver
            .resolve_layer(tx.as_mut(), a, "C-STORM", Some(&red()))
            .expect("解析图层");
        resolver.clear();
        let (layer, _) = resolver
            .resolve_layer(tx.as_mut(), b, "C-STORM", None)
            .expect("解析图层");
        let stored = tx.layer(layer).expect("读取").expect("存在");
        assert_eq!(stored.color, Color::RED);
        assert_eq!(stored.drawing_id, b);
    }

    #[test]
    fn missing_symbol_is_not_an_error() {
        let store = MemoryStore::new();
        let mut tx = store.begin().expect("开启事务");
        let mut resolver = NameResolver::new();
        assert_eq!(resolver.resolve_symbol(tx.as_mut(), "MH").expect("查找"), None);
        assert_eq!(resolver.resolve_symbol(tx.as_mut(), "MH").expect("查找"), None);
        assert_eq!(resolver.stats().lookups, 1);
        assert!(
            tx.standards(StandardCategory::Symbol)
                .expect("列表")
                .is_empty()
        );

        let id = resolver
            .register_symbol(tx.as_mut(), "MH", SymbolDefinition::default())
            .expect("登记");
        assert_eq!(resolver.resolve_symbol(tx.as_mut(), "MH").expect("查找"), Some(id));
    }
}
