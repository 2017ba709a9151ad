/// 通配符规则匹配模块
///
/// 规则为简单通配符：`*` 匹配任意长度的字符串，`?` 恰好匹配一个字符。
/// 匹配区分大小写，调用方需要先把主机名转成小写。

/// 判断 target 是否匹配规则列表中的任意一条，命中第一条即返回
pub fn match_wildcards(target: &str, patterns: &[String]) -> bool {
    patterns.iter().any(|p| match_wildcard(p, target))
}

/// 单条通配符匹配
pub fn match_wildcard(pattern: &str, target: &str) -> bool {
    let pattern = pattern.as_bytes();
    let target = target.as_bytes();

    // 迭代回溯：记录最近一个 `*` 的位置，失配时回退到它并多吞一个字符
    let mut p = 0;
    let mut t = 0;
    let mut star: Option<usize> = None;
    let mut mark = 0;

    while t < target.len() {
        if p < pattern.len() && (pattern[p] == b'?' || pattern[p] == target[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == b'*' {
            star = Some(p);
            mark = t;
            p += 1;
        } else if let Some(s) = star {
            p = s + 1;
            mark += 1;
            t = mark;
        } else {
            return false;
        }
    }

    // 剩余的模式必须全部是 `*`
    while p < pattern.len() && pattern[p] == b'*' {
        p += 1;
    }

    p == pattern.len()
}
