/// Lua script for the atomic conditional set (SET NX PX).
///
/// KEYS\[1\] = the lock key
/// ARGV\[1\] = value to store
/// ARGV\[2\] = TTL in milliseconds
///
/// Returns 1 if the key was newly set, 0 if it already existed.
pub const SET_IF_ABSENT: &str = r"
local ok = redis.call('SET', KEYS[1], ARGV[1], 'NX', 'PX', ARGV[2])
if ok then
    return 1
end
return 0
";
