//! colorDescriptor 输出的 KOEN1 文本格式
//!
//! ```text
//! KOEN1
//! <描述符维度>
//! <关键点数量>
//! <CIRCLE x y scale orientation cornerness>; v1 v2 ... vD;
//! ```

use ndarray::Array2;

use crate::matrix::{INFO_WIDTH, RawTables};

const MAGIC: &str = "KOEN1";

/// 解析 KOEN1 文本，出错时返回原因
pub fn parse_koen1(text: &str) -> Result<RawTables, String> {
    let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());

    match lines.next() {
        Some(MAGIC) => {}
        Some(other) => return Err(format!("文件头错误: {other:?}")),
        None => return Err("输出为空".to_string()),
    }
    let dim = parse_header_number(lines.next(), "描述符维度")?;
    let count = parse_header_number(lines.next(), "关键点数量")?;

    if count.checked_mul(dim.max(INFO_WIDTH)).is_none() {
        return Err(format!("关键点数量过大: {count} × {dim}"));
    }
    // 每个数值至少占两个字节，预留空间不超过文本长度
    let mut info = Vec::with_capacity(count.saturating_mul(INFO_WIDTH).min(text.len() / 2));
    let mut descriptors = Vec::with_capacity(count.saturating_mul(dim).min(text.len() / 2));
    let mut rows = 0;
    for line in lines {
        if rows == count {
            return Err(format!("关键点数量超过声明的 {count}"));
        }
        parse_row(line, dim, &mut info, &mut descriptors).map_err(|e| format!("第 {} 行: {e}", rows + 1))?;
        rows += 1;
    }
    if rows != count {
        return Err(format!("声明 {count} 个关键点，实际只有 {rows} 个"));
    }

    let info = Array2::from_shape_vec((rows, INFO_WIDTH), info).map_err(|e| e.to_string())?;
    let descriptors = Array2::from_shape_vec((rows, dim), descriptors).map_err(|e| e.to_string())?;
    Ok(RawTables { info, descriptors })
}

fn parse_header_number(line: Option<&str>, name: &str) -> Result<usize, String> {
    let line = line.ok_or_else(|| format!("缺少{name}"))?;
    line.parse().map_err(|_| format!("无效的{name}: {line:?}"))
}

fn parse_row(line: &str, dim: usize, info: &mut Vec<f64>, descriptors: &mut Vec<f32>) -> Result<(), String> {
    let mut parts = line.split(';');
    let region = parts.next().unwrap_or_default().trim();
    let values = parts.next().ok_or("缺少描述符")?;

    let region = region
        .strip_prefix('<')
        .and_then(|r| r.strip_suffix('>'))
        .ok_or_else(|| format!("无效的区域: {region:?}"))?;
    let mut fields = region.split_whitespace();
    if fields.next() != Some("CIRCLE") {
        return Err(format!("不支持的区域类型: {region:?}"));
    }
    let before = info.len();
    for field in fields {
        info.push(field.parse().map_err(|_| format!("无效的数值: {field:?}"))?);
    }
    if info.len() - before != INFO_WIDTH {
        return Err(format!("区域应有 {INFO_WIDTH} 个数值，实际 {}", info.len() - before));
    }

    let before = descriptors.len();
    for v in values.split_whitespace() {
        descriptors.push(v.parse().map_err(|_| format!("无效的数值: {v:?}"))?);
    }
    if descriptors.len() - before != dim {
        return Err(format!("描述符应有 {dim} 维，实际 {}", descriptors.len() - before));
    }
    Ok(())
}
