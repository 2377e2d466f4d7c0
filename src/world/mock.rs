//! Mock World（用于测试与离线运行，无需真实服务器）
//!
//! 内存中维护方块、背包、窗口与玩家；窗口跳转（点击 / 关闭 / 聊天命令 / 激活方块）可脚本化，
//! 并记录调用日志，便于断言调度器的交互顺序。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use super::{
    AgentRef, BlockRef, BreakOptions, Credentials, ItemStack, Position, Session, SessionEvent,
    Vec3, WindowView, World, WorldConnector, WorldError,
};

const INVENTORY_SLOTS: u32 = 36;
const STACK_SIZE: u32 = 64;
const CONTAINER_SLOTS: usize = 27;

/// 由物品名推导稳定的物品 ID
pub fn mock_item_id(name: &str) -> u32 {
    name.bytes()
        .fold(17u32, |acc, b| acc.wrapping_mul(31).wrapping_add(u32::from(b)))
        % 10_000
}

/// 构造一格 mock 物品
pub fn stack(name: &str, count: u32) -> ItemStack {
    ItemStack::new(mock_item_id(name), name, count)
}

#[derive(Default)]
struct MockState {
    posture: bool,
    blocks: HashMap<Position, String>,
    inventory: Vec<ItemStack>,
    cursor: Option<Position>,
    cursor_override: Option<Option<BlockRef>>,
    window: Option<WindowView>,
    next_window_id: u32,
    players: HashMap<String, AgentRef>,
    block_windows: HashMap<String, WindowView>,
    chat_windows: HashMap<String, WindowView>,
    click_transitions: HashMap<(String, usize), Option<WindowView>>,
    close_transitions: HashMap<String, WindowView>,
    deposits: Vec<(String, u32, u32)>,
    equipped: Option<ItemStack>,
    chat_log: Vec<String>,
    calls: Vec<String>,
    fail_open: u32,
    fail_activate: u32,
    fail_withdraw: bool,
    fail_break: bool,
    panic_on: Option<String>,
    revert_on_action: bool,
    quit: bool,
    events: Option<mpsc::UnboundedSender<SessionEvent>>,
}

impl MockState {
    fn add_item(&mut self, name: &str, mut count: u32) {
        let id = mock_item_id(name);
        for existing in self.inventory.iter_mut().filter(|s| s.id == id) {
            let room = STACK_SIZE.saturating_sub(existing.count);
            let moved = room.min(count);
            existing.count += moved;
            count -= moved;
        }
        while count > 0 {
            let moved = count.min(STACK_SIZE);
            self.inventory.push(ItemStack::new(id, name, moved));
            count -= moved;
        }
    }

    fn remove_items(&mut self, id: u32, mut count: u32) -> u32 {
        let mut removed = 0;
        for existing in self.inventory.iter_mut().filter(|s| s.id == id) {
            let taken = existing.count.min(count);
            existing.count -= taken;
            count -= taken;
            removed += taken;
        }
        self.inventory.retain(|s| s.count > 0);
        removed
    }

    fn open_window(&mut self, template: &WindowView, tx: &broadcast::Sender<WindowView>) {
        self.next_window_id += 1;
        let mut view = template.clone();
        view.id = self.next_window_id;
        self.window = Some(view.clone());
        let _ = tx.send(view);
    }

    fn emit(&self, event: SessionEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}

/// 内存 World 实现
pub struct MockWorld {
    username: String,
    position: Vec3,
    state: Mutex<MockState>,
    window_tx: broadcast::Sender<WindowView>,
    action_delay: Duration,
}

impl MockWorld {
    pub fn new(username: &str) -> Self {
        let (window_tx, _) = broadcast::channel(16);
        Self {
            username: username.to_string(),
            position: Vec3::new(0.5, 64.0, 0.5),
            state: Mutex::new(MockState::default()),
            window_tx,
            action_delay: Duration::ZERO,
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn with_position(mut self, position: Vec3) -> Self {
        self.position = position;
        self
    }

    /// 每个异步动作的模拟耗时
    pub fn with_action_delay(mut self, delay: Duration) -> Self {
        self.action_delay = delay;
        self
    }

    pub fn with_block(self, kind: &str, position: Position) -> Self {
        self.state().blocks.insert(position, kind.to_string());
        self
    }

    pub fn with_item(self, name: &str, count: u32) -> Self {
        self.state().add_item(name, count);
        self
    }

    pub fn with_player(self, name: &str, position: Vec3) -> Self {
        self.add_player(name, position);
        self
    }

    /// 激活某类方块时打开的窗口
    pub fn with_block_window(self, kind: &str, view: WindowView) -> Self {
        self.state().block_windows.insert(kind.to_string(), view);
        self
    }

    /// 发送某条聊天命令时打开的窗口
    pub fn with_chat_window(self, command: &str, view: WindowView) -> Self {
        self.state().chat_windows.insert(command.to_string(), view);
        self
    }

    /// 在标题为 `title` 的窗口点击 `slot` 后切换到 `next`（None 表示关闭）
    pub fn with_click_transition(self, title: &str, slot: usize, next: Option<WindowView>) -> Self {
        self.state()
            .click_transitions
            .insert((title.to_string(), slot), next);
        self
    }

    /// 关闭标题为 `title` 的窗口后打开 `next`
    pub fn with_close_transition(self, title: &str, next: WindowView) -> Self {
        self.state().close_transitions.insert(title.to_string(), next);
        self
    }

    /// 强制准星返回指定方块（None 表示看向空气）
    pub fn with_cursor_override(self, block: Option<BlockRef>) -> Self {
        self.state().cursor_override = Some(block);
        self
    }

    /// 每个异步动作后世界悄悄撤销姿态
    pub fn with_posture_revert_on_action(self) -> Self {
        self.state().revert_on_action = true;
        self
    }

    pub fn add_player(&self, name: &str, position: Vec3) {
        self.state().players.insert(
            name.to_string(),
            AgentRef {
                name: name.to_string(),
                position: Some(position),
            },
        );
    }

    pub fn fail_next_opens(&self, count: u32) {
        self.state().fail_open = count;
    }

    pub fn fail_next_activations(&self, count: u32) {
        self.state().fail_activate = count;
    }

    pub fn set_fail_withdraw(&self, fail: bool) {
        self.state().fail_withdraw = fail;
    }

    pub fn set_fail_break(&self, fail: bool) {
        self.state().fail_break = fail;
    }

    /// 以 `prefix` 开头的下一次动作直接 panic（模拟处理器崩溃）
    pub fn set_panic_on(&self, prefix: Option<&str>) {
        self.state().panic_on = prefix.map(str::to_string);
    }

    /// 模拟世界撤销姿态，并推送 PostureChanged(false)
    pub fn revert_posture(&self) {
        let mut state = self.state();
        state.posture = false;
        state.emit(SessionEvent::PostureChanged(false));
    }

    /// 模拟服务器主动断开
    pub fn kick(&self, reason: &str) {
        let state = self.state();
        state.emit(SessionEvent::Kicked(reason.to_string()));
        state.emit(SessionEvent::Ended);
    }

    pub fn emit(&self, event: SessionEvent) {
        self.state().emit(event);
    }

    pub fn attach_events(&self, tx: mpsc::UnboundedSender<SessionEvent>) {
        self.state().events = Some(tx);
    }

    pub fn has_block(&self, position: Position) -> bool {
        self.state().blocks.contains_key(&position)
    }

    pub fn deposits(&self) -> Vec<(String, u32, u32)> {
        self.state().deposits.clone()
    }

    pub fn equipped(&self) -> Option<ItemStack> {
        self.state().equipped.clone()
    }

    pub fn chat_log(&self) -> Vec<String> {
        self.state().chat_log.clone()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    pub fn has_quit(&self) -> bool {
        self.state().quit
    }

    async fn act(&self, call: String) {
        if !self.action_delay.is_zero() {
            tokio::time::sleep(self.action_delay).await;
        }
        let panic_on = self.state().panic_on.take();
        if let Some(prefix) = panic_on {
            if call.starts_with(&prefix) {
                panic!("mock world crashed on {call}");
            }
            self.state().panic_on = Some(prefix);
        }
        let mut state = self.state();
        if state.revert_on_action {
            state.posture = false;
        }
        state.calls.push(call);
    }
}

#[async_trait]
impl World for MockWorld {
    fn username(&self) -> String {
        self.username.clone()
    }

    fn position(&self) -> Vec3 {
        self.position
    }

    fn posture(&self) -> bool {
        self.state().posture
    }

    fn set_posture(&self, on: bool) {
        self.state().posture = on;
    }

    fn find_nearest_block(&self, kinds: &[String], max_distance: f64) -> Option<BlockRef> {
        let state = self.state();
        state
            .blocks
            .iter()
            .filter(|(_, kind)| kinds.iter().any(|k| k == *kind))
            .map(|(pos, kind)| (self.position.distance_to(&pos.center()), pos, kind))
            .filter(|(distance, _, _)| *distance <= max_distance)
            .min_by(|a, b| a.0.total_cmp(&b.0))
            .map(|(_, pos, kind)| BlockRef::new(kind.clone(), *pos))
    }

    fn find_blocks(
        &self,
        kind: &str,
        max_distance: f64,
        origin: Vec3,
        limit: usize,
    ) -> Vec<Position> {
        let state = self.state();
        let mut found: Vec<(f64, Position)> = state
            .blocks
            .iter()
            .filter(|(_, k)| k.as_str() == kind)
            .map(|(pos, _)| (origin.distance_to(&pos.center()), *pos))
            .filter(|(distance, _)| *distance <= max_distance)
            .collect();
        found.sort_by(|a, b| a.0.total_cmp(&b.0));
        found.into_iter().take(limit).map(|(_, pos)| pos).collect()
    }

    fn block_at(&self, position: Position) -> Option<BlockRef> {
        self.state()
            .blocks
            .get(&position)
            .map(|kind| BlockRef::new(kind.clone(), position))
    }

    fn block_at_cursor(&self, max_distance: f64) -> Option<BlockRef> {
        let state = self.state();
        if let Some(forced) = &state.cursor_override {
            return forced.clone();
        }
        let cursor = state.cursor?;
        if self.position.distance_to(&cursor.center()) > max_distance {
            return None;
        }
        state
            .blocks
            .get(&cursor)
            .map(|kind| BlockRef::new(kind.clone(), cursor))
    }

    async fn look_at(&self, target: Vec3) -> Result<(), WorldError> {
        self.act(format!("look:{}", target.block())).await;
        self.state().cursor = Some(target.block());
        Ok(())
    }

    async fn activate_block(&self, block: &BlockRef) -> Result<(), WorldError> {
        self.act(format!("activate:{}", block.position)).await;
        let mut state = self.state();
        if state.fail_activate > 0 {
            state.fail_activate -= 1;
            return Err(WorldError::Rejected("activation refused".into()));
        }
        if let Some(template) = state.block_windows.get(&block.kind).cloned() {
            state.open_window(&template, &self.window_tx);
        }
        Ok(())
    }

    async fn break_block(
        &self,
        block: &BlockRef,
        _options: BreakOptions,
    ) -> Result<(), WorldError> {
        self.act(format!("break:{}", block.position)).await;
        let mut state = self.state();
        if state.fail_break {
            return Err(WorldError::Timeout("dig".into()));
        }
        match state.blocks.remove(&block.position) {
            Some(kind) => {
                state.add_item(&kind, 1);
                Ok(())
            }
            None => Err(WorldError::Rejected(format!("no block at {}", block.position))),
        }
    }

    async fn equip(&self, item: &ItemStack) -> Result<(), WorldError> {
        self.act(format!("equip:{}", item.name)).await;
        self.state().equipped = Some(item.clone());
        Ok(())
    }

    fn items(&self) -> Vec<ItemStack> {
        self.state().inventory.clone()
    }

    fn empty_slot_count(&self) -> u32 {
        INVENTORY_SLOTS.saturating_sub(self.state().inventory.len() as u32)
    }

    async fn open_container(&self, block: &BlockRef) -> Result<WindowView, WorldError> {
        self.act(format!("open:{}", block.position)).await;
        let mut state = self.state();
        if state.fail_open > 0 {
            state.fail_open -= 1;
            return Err(WorldError::Timeout("container did not open".into()));
        }
        if !state.blocks.contains_key(&block.position) {
            return Err(WorldError::Rejected(format!("no container at {}", block.position)));
        }
        let template = WindowView::new(0, block.kind.clone(), vec![None; CONTAINER_SLOTS]);
        state.open_window(&template, &self.window_tx);
        state.window.clone().ok_or(WorldError::NoWindow)
    }

    fn current_window(&self) -> Option<WindowView> {
        self.state().window.clone()
    }

    fn subscribe_windows(&self) -> broadcast::Receiver<WindowView> {
        self.window_tx.subscribe()
    }

    async fn deposit(&self, item_id: u32, count: u32) -> Result<(), WorldError> {
        self.act(format!("deposit:{item_id}x{count}")).await;
        let mut state = self.state();
        let title = state
            .window
            .as_ref()
            .map(|w| w.title.clone())
            .ok_or(WorldError::NoWindow)?;
        let removed = state.remove_items(item_id, count);
        if removed == 0 {
            return Err(WorldError::Rejected("nothing to deposit".into()));
        }
        state.deposits.push((title, item_id, removed));
        Ok(())
    }

    async fn withdraw(&self, item_id: u32, count: u32) -> Result<(), WorldError> {
        self.act(format!("withdraw:{item_id}x{count}")).await;
        let mut state = self.state();
        if state.fail_withdraw {
            return Err(WorldError::Rejected("withdraw refused".into()));
        }
        let mut window = state.window.take().ok_or(WorldError::NoWindow)?;
        let mut remaining = count;
        let mut taken: Vec<(String, u32)> = Vec::new();
        for slot in window.slots.iter_mut() {
            if remaining == 0 {
                break;
            }
            if let Some(item) = slot.as_mut().filter(|item| item.id == item_id) {
                let moved = item.count.min(remaining);
                item.count -= moved;
                remaining -= moved;
                taken.push((item.name.clone(), moved));
                if item.count == 0 {
                    *slot = None;
                }
            }
        }
        state.window = Some(window);
        for (name, moved) in taken {
            state.add_item(&name, moved);
        }
        Ok(())
    }

    async fn click_slot(&self, slot: usize, _button: u8, _mode: u8) -> Result<(), WorldError> {
        self.act(format!("click:{slot}")).await;
        let mut state = self.state();
        let mut window = state.window.take().ok_or(WorldError::NoWindow)?;
        let key = (window.title.clone(), slot);
        if let Some(next) = state.click_transitions.get(&key).cloned() {
            match next {
                Some(template) => state.open_window(&template, &self.window_tx),
                None => state.window = None,
            }
            return Ok(());
        }
        let picked = window.slots.get_mut(slot).and_then(Option::take);
        state.window = Some(window);
        if let Some(item) = picked {
            state.add_item(&item.name, item.count);
        }
        Ok(())
    }

    fn close_window(&self) {
        let mut state = self.state();
        let Some(window) = state.window.take() else {
            return;
        };
        state.calls.push(format!("close:{}", window.title));
        if let Some(next) = state.close_transitions.get(&window.title).cloned() {
            state.open_window(&next, &self.window_tx);
        }
    }

    fn send_chat(&self, text: &str) {
        let mut state = self.state();
        state.chat_log.push(text.to_string());
        if let Some(template) = state.chat_windows.get(text).cloned() {
            state.open_window(&template, &self.window_tx);
        }
    }

    fn players(&self) -> HashMap<String, AgentRef> {
        let mut players = self.state().players.clone();
        players.insert(
            self.username.clone(),
            AgentRef {
                name: self.username.clone(),
                position: Some(self.position),
            },
        );
        players
    }

    fn quit(&self) {
        let mut state = self.state();
        if state.quit {
            return;
        }
        state.quit = true;
        state.emit(SessionEvent::Ended);
    }
}

type WorldFactory = Box<dyn Fn() -> MockWorld + Send + Sync>;

/// Mock 连接器：每次连接用工厂创建新的 MockWorld，并立即推送 Spawned
pub struct MockConnector {
    factory: WorldFactory,
    fail_remaining: AtomicU32,
    attempts: AtomicU32,
    sessions: Mutex<Vec<Arc<MockWorld>>>,
}

impl MockConnector {
    pub fn new(factory: impl Fn() -> MockWorld + Send + Sync + 'static) -> Self {
        Self {
            factory: Box::new(factory),
            fail_remaining: AtomicU32::new(0),
            attempts: AtomicU32::new(0),
            sessions: Mutex::new(Vec::new()),
        }
    }

    /// 前 `count` 次连接失败
    pub fn failing_first(self, count: u32) -> Self {
        self.fail_remaining.store(count, Ordering::SeqCst);
        self
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// 最近一次建立的会话
    pub fn last_session(&self) -> Option<Arc<MockWorld>> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned()
    }
}

#[async_trait]
impl WorldConnector for MockConnector {
    async fn connect(&self, credentials: &Credentials) -> Result<Session, WorldError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(WorldError::ConnectFailed(format!(
                "{}:{} refused connection",
                credentials.host, credentials.port
            )));
        }

        let world = Arc::new((self.factory)());
        let (tx, rx) = mpsc::unbounded_channel();
        world.attach_events(tx);
        world.emit(SessionEvent::LoginConfirmed);
        world.emit(SessionEvent::Spawned);
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::clone(&world));

        Ok(Session { world, events: rx })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inventory_stacks_and_empty_slots() {
        let world = MockWorld::new("me").with_item("bone", 130);
        let items = world.items();
        assert_eq!(items.len(), 3);
        assert_eq!(items.iter().map(|s| s.count).sum::<u32>(), 130);
        assert_eq!(world.empty_slot_count(), INVENTORY_SLOTS - 3);
    }

    #[tokio::test]
    async fn test_click_transition_and_close_transition() {
        let menu = WindowView::new(0, "menu", vec![None; 9]);
        let next = WindowView::new(0, "next", vec![None; 9]);
        let world = MockWorld::new("me")
            .with_chat_window("/menu", menu)
            .with_click_transition("menu", 3, Some(next.clone()))
            .with_close_transition("next", WindowView::new(0, "after", vec![]));

        world.send_chat("/menu");
        assert_eq!(world.current_window().map(|w| w.title), Some("menu".into()));
        world.click_slot(3, 0, 0).await.unwrap();
        assert_eq!(world.current_window().map(|w| w.title), Some("next".into()));
        world.close_window();
        assert_eq!(world.current_window().map(|w| w.title), Some("after".into()));
    }

    #[test]
    fn test_players_include_self() {
        let world = MockWorld::new("me").with_player("other", Vec3::new(1.0, 64.0, 1.0));
        let players = world.players();
        assert!(players.contains_key("me"));
        assert!(players.contains_key("other"));
    }

    #[tokio::test]
    async fn test_connector_fails_then_connects() {
        let connector = MockConnector::new(|| MockWorld::new("me")).failing_first(1);
        let creds = Credentials {
            host: "localhost".into(),
            port: 25565,
            username: "me".into(),
            auth: "offline".into(),
            version: "1.20".into(),
        };
        assert!(connector.connect(&creds).await.is_err());
        let mut session = connector.connect(&creds).await.unwrap();
        assert_eq!(connector.attempts(), 2);
        assert_eq!(session.events.recv().await, Some(SessionEvent::LoginConfirmed));
        assert_eq!(session.events.recv().await, Some(SessionEvent::Spawned));
    }
}
