/// Path processing utility functions / 路径处理工具函数
///
/// Virtual tree keys never start with `/` and never contain `.` or `..`;
/// the root is the empty string.

/// Clean and normalize path / 清理和规范化路径
/// 1. Replace backslashes with forward slashes / 将反斜杠替换为正斜杠
/// 2. Drop empty and `.` segments, resolve `..` / 清理路径中的 . 和 ..
/// 3. Strip leading and trailing `/` / 去掉首尾的 /
pub fn clean_path(path: &str) -> String {
    let path = path.replace('\\', "/");
    let mut parts: Vec<&str> = Vec::new();

    for part in path.split('/') {
        match part {
            "" | "." => continue,
            ".." => {
                parts.pop();
            }
            _ => parts.push(part),
        }
    }

    parts.join("/")
}

/// Check if path is the virtual root / 判断是否为根路径
pub fn is_root_path(path: &str) -> bool {
    clean_path(path).is_empty()
}

/// Last segment of a path / 获取路径最后一段
pub fn path_base(path: &str) -> String {
    let path = clean_path(path);
    match path.rfind('/') {
        Some(pos) => path[pos + 1..].to_string(),
        None => path,
    }
}

/// Parent of a path, root for top-level entries / 获取父路径
pub fn path_parent(path: &str) -> String {
    let path = clean_path(path);
    match path.rfind('/') {
        Some(pos) => path[..pos].to_string(),
        None => String::new(),
    }
}

/// Join a parent path and a child name / 拼接路径
pub fn path_join(parent: &str, name: &str) -> String {
    clean_path(&format!("{}/{}", parent, name))
}

/// Number of segments, 0 for root / 路径深度
pub fn path_depth(path: &str) -> usize {
    let path = clean_path(path);
    if path.is_empty() {
        0
    } else {
        path.matches('/').count() + 1
    }
}

/// The path and all of its ancestors, ending with root / 路径及其所有祖先
pub fn path_parent_tree(path: &str) -> Vec<String> {
    let mut path = clean_path(path);
    let mut result = Vec::with_capacity(path_depth(&path) + 1);
    while !path.is_empty() {
        let parent = path_parent(&path);
        result.push(path);
        path = parent;
    }
    result.push(String::new());
    result
}

/// Check if sub_path is path itself or below it / 判断 sub_path 是否是 path 的子路径
pub fn is_sub_path(path: &str, sub_path: &str) -> bool {
    let path = clean_path(path);
    let sub_path = clean_path(sub_path);
    if path.is_empty() || path == sub_path {
        return true;
    }
    sub_path.starts_with(&format!("{}/", path))
}

/// Milliseconds since epoch / 毫秒时间戳
pub fn millis(time: chrono::DateTime<chrono::Utc>) -> i64 {
    time.timestamp_millis()
}

/// Parse an integer form value, falling back to a default / 解析整数，失败时使用默认值
pub fn to_i64(value: Option<&str>, default: i64) -> i64 {
    value
        .and_then(|v| v.trim().parse::<i64>().ok())
        .unwrap_or(default)
}
